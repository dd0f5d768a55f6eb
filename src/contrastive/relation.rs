//! Label relation tensors: which global examples are instance positives,
//! partial-class positives, or negatives for every local example.

use std::fmt;

use crate::error::{ContrastError, ContrastResult};

/// Relation between local example `i` and global example `j`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Relation {
    /// Different class, different instance
    Negative = 0,
    /// Same class, different instance
    ClassPositive = 1,
    /// The paired view of the same instance
    InstancePositive = 2,
}

impl Relation {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Relation::Negative),
            1 => Some(Relation::ClassPositive),
            2 => Some(Relation::InstancePositive),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Instance and class positives both count toward the supervised target
    pub fn is_positive(self) -> bool {
        !matches!(self, Relation::Negative)
    }
}

/// Explicit mapping from local index to the global index of its paired view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairIndex(Vec<usize>);

impl PairIndex {
    pub fn new(indices: Vec<usize>) -> Self {
        Self(indices)
    }

    /// Mapping for a rank-major all-gather: rank `r` owns rows `r*N .. (r+1)*N`
    pub fn rank_major(rank: usize, local_batch: usize) -> Self {
        let offset = rank * local_batch;
        Self((offset..offset + local_batch).collect())
    }

    /// The single-worker mapping `i -> i`
    pub fn identity(local_batch: usize) -> Self {
        Self::rank_major(0, local_batch)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

/// Validated `[N, M]` relation tensor.
///
/// Every row holds exactly one [`Relation::InstancePositive`]; the
/// constructors reject anything else, so consumers never re-check.
#[derive(Clone, PartialEq, Eq)]
pub struct RelationTensor {
    cells: Vec<Relation>,
    rows: usize,
    cols: usize,
    instance: Vec<usize>,
}

impl RelationTensor {
    /// Build relations from labels and the explicit pair mapping
    pub fn from_labels(
        local_labels: &[i64],
        global_labels: &[i64],
        pairs: &PairIndex,
    ) -> ContrastResult<Self> {
        let (rows, cols) = (local_labels.len(), global_labels.len());
        if pairs.len() != rows {
            return Err(ContrastError::shape_mismatch(
                "pair index",
                &format!("{} entries", rows),
                &format!("{} entries", pairs.len()),
            ));
        }
        if cols < rows {
            return Err(ContrastError::shape_mismatch(
                "global labels",
                &format!("at least {} (local batch)", rows),
                &cols.to_string(),
            ));
        }

        let mut cells = Vec::with_capacity(rows * cols);
        for (i, (&label, &pair)) in local_labels.iter().zip(pairs.as_slice()).enumerate() {
            if pair >= cols {
                return Err(ContrastError::invalid_relation(
                    i,
                    &format!("pair index {} outside global batch of {}", pair, cols),
                ));
            }
            if global_labels[pair] != label {
                return Err(ContrastError::invalid_relation(
                    i,
                    &format!(
                        "paired view at {} has label {} but the example has label {}",
                        pair, global_labels[pair], label
                    ),
                ));
            }
            cells.extend(global_labels.iter().enumerate().map(|(j, &other)| {
                if j == pair {
                    Relation::InstancePositive
                } else if other == label {
                    Relation::ClassPositive
                } else {
                    Relation::Negative
                }
            }));
        }

        Ok(Self {
            cells,
            rows,
            cols,
            instance: pairs.as_slice().to_vec(),
        })
    }

    /// Build relations from raw integer codes, validating every row
    pub fn from_codes(codes: &[i64], rows: usize, cols: usize) -> ContrastResult<Self> {
        if codes.len() != rows * cols {
            return Err(ContrastError::shape_mismatch(
                "relation codes",
                &format!("{} ({}x{})", rows * cols, rows, cols),
                &codes.len().to_string(),
            ));
        }

        let mut cells = Vec::with_capacity(codes.len());
        let mut instance = Vec::with_capacity(rows);
        for i in 0..rows {
            let mut found = None;
            for (j, &code) in codes[i * cols..(i + 1) * cols].iter().enumerate() {
                let relation = Relation::from_code(code).ok_or_else(|| {
                    ContrastError::invalid_relation(
                        i,
                        &format!("code {} at column {} is not in {{0, 1, 2}}", code, j),
                    )
                })?;
                if relation == Relation::InstancePositive {
                    if let Some(first) = found {
                        return Err(ContrastError::invalid_relation(
                            i,
                            &format!("instance positives at columns {} and {}", first, j),
                        ));
                    }
                    found = Some(j);
                }
                cells.push(relation);
            }
            let pair = found
                .ok_or_else(|| ContrastError::invalid_relation(i, "no instance positive"))?;
            instance.push(pair);
        }

        Ok(Self {
            cells,
            rows,
            cols,
            instance,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, i: usize, j: usize) -> Relation {
        self.cells[i * self.cols + j]
    }

    pub fn row(&self, i: usize) -> &[Relation] {
        &self.cells[i * self.cols..(i + 1) * self.cols]
    }

    /// Global column of row `i`'s instance positive
    pub fn instance_index(&self, i: usize) -> usize {
        self.instance[i]
    }

    pub fn codes(&self) -> Vec<u8> {
        self.cells.iter().map(|r| r.code()).collect()
    }

    pub fn instance_mask(&self) -> Vec<bool> {
        self.mask(|r| r == Relation::InstancePositive)
    }

    /// Same label, including the instance positive
    pub fn class_mask(&self) -> Vec<bool> {
        self.mask(Relation::is_positive)
    }

    /// Same label, excluding the instance positive
    pub fn partial_class_mask(&self) -> Vec<bool> {
        self.mask(|r| r == Relation::ClassPositive)
    }

    pub fn negative_mask(&self) -> Vec<bool> {
        self.mask(|r| r == Relation::Negative)
    }

    /// Number of entries in row `i` equal to `relation`
    pub fn count(&self, i: usize, relation: Relation) -> usize {
        self.row(i).iter().filter(|&&r| r == relation).count()
    }

    fn mask(&self, pred: impl Fn(Relation) -> bool) -> Vec<bool> {
        self.cells.iter().map(|&r| pred(r)).collect()
    }
}

impl fmt::Debug for RelationTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationTensor")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_from_labels_single_worker() {
        let labels = [0, 0, 1, 1];
        let rel = RelationTensor::from_labels(&labels, &labels, &PairIndex::identity(4)).unwrap();
        assert_eq!(
            rel.codes(),
            vec![2, 1, 0, 0, 1, 2, 0, 0, 0, 0, 2, 1, 0, 0, 1, 2]
        );
        assert_eq!(rel.count(0, Relation::ClassPositive), 1);
        assert_eq!(rel.instance_index(3), 3);
    }

    #[test]
    fn test_from_labels_rank_offset() {
        // rank 1 of 2, local batch 2: own views live at global 2 and 3
        let local = [5, 7];
        let global = [7, 5, 5, 7];
        let rel = RelationTensor::from_labels(&local, &global, &PairIndex::rank_major(1, 2)).unwrap();
        assert_eq!(rel.codes(), vec![0, 1, 2, 0, 1, 0, 0, 2]);
    }

    #[test]
    fn test_masks_are_disjoint_and_cover() {
        let labels = [3, 1, 3, 2, 1];
        let rel = RelationTensor::from_labels(&labels, &labels, &PairIndex::identity(5)).unwrap();
        let inst = rel.instance_mask();
        let partial = rel.partial_class_mask();
        let neg = rel.negative_mask();
        let class = rel.class_mask();
        for k in 0..inst.len() {
            let hits = [inst[k], partial[k], neg[k]].iter().filter(|&&b| b).count();
            assert_eq!(hits, 1);
            assert_eq!(class[k], inst[k] || partial[k]);
        }
    }

    #[test]
    fn test_random_labels_have_one_instance_per_row() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let world = rng.gen_range(1..4);
            let local = rng.gen_range(1..9);
            let classes = rng.gen_range(1..5);
            let global: Vec<i64> = (0..world * local).map(|_| rng.gen_range(0..classes)).collect();
            let rank = rng.gen_range(0..world);
            let local_labels = &global[rank * local..(rank + 1) * local];

            let rel = RelationTensor::from_labels(
                local_labels,
                &global,
                &PairIndex::rank_major(rank, local),
            )
            .unwrap();

            for i in 0..rel.rows() {
                assert_eq!(rel.count(i, Relation::InstancePositive), 1);
                assert!(rel.row(i).iter().all(|r| r.code() <= 2));
            }
        }
    }

    #[test]
    fn test_from_codes_rejects_two_instance_positives() {
        let codes = [2, 2, 0, 0, 2, 1];
        let err = RelationTensor::from_codes(&codes, 2, 3).unwrap_err();
        assert!(matches!(err, ContrastError::InvalidRelation(_)));
    }

    #[test]
    fn test_from_codes_rejects_missing_instance_and_bad_codes() {
        assert!(matches!(
            RelationTensor::from_codes(&[0, 1, 1], 1, 3).unwrap_err(),
            ContrastError::InvalidRelation(_)
        ));
        assert!(matches!(
            RelationTensor::from_codes(&[2, 3, 0], 1, 3).unwrap_err(),
            ContrastError::InvalidRelation(_)
        ));
        assert!(matches!(
            RelationTensor::from_codes(&[2, -1, 0], 1, 3).unwrap_err(),
            ContrastError::InvalidRelation(_)
        ));
        assert!(matches!(
            RelationTensor::from_codes(&[2, 0], 1, 3).unwrap_err(),
            ContrastError::ShapeMismatch(_)
        ));
    }

    #[test]
    fn test_from_labels_rejects_bad_pairs() {
        let labels = [0, 1];
        let out_of_range = RelationTensor::from_labels(&labels, &labels, &PairIndex::new(vec![0, 2]));
        assert!(matches!(out_of_range.unwrap_err(), ContrastError::InvalidRelation(_)));

        let wrong_label = RelationTensor::from_labels(&labels, &labels, &PairIndex::new(vec![1, 0]));
        assert!(matches!(wrong_label.unwrap_err(), ContrastError::InvalidRelation(_)));

        let short = RelationTensor::from_labels(&labels, &labels, &PairIndex::new(vec![0]));
        assert!(matches!(short.unwrap_err(), ContrastError::ShapeMismatch(_)));
    }

    #[test]
    fn test_from_labels_rejects_short_global_batch() {
        let local = [0, 1, 0];
        let global = [0, 1];
        let result = RelationTensor::from_labels(&local, &global, &PairIndex::identity(3));
        assert!(matches!(result.unwrap_err(), ContrastError::ShapeMismatch(_)));
    }
}
