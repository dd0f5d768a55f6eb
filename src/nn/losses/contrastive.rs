//! Contrastive losses over a global similarity matrix
//!
//! Every variant sees one row at a time: the relation codes of local example
//! `i` against the `M` global examples, and the scaled similarities with the
//! row maximum already subtracted. Subtracting the maximum does not change any
//! variant's value, since each is a log-ratio of sums of exponentials.

use rayon::prelude::*;

use super::LossKind;
use crate::{
    contrastive::{Relation, RelationTensor, SimilarityMatrix},
    distributed::GlobalCollector,
    error::{ContrastError, ContrastResult},
    tensor::{
        ops::{log_add_exp, log_sum_exp, masked_log_sum_exp},
        Shape, Tensor,
    },
};

/// Multiplier applied to cosine similarities before the softmax
pub const DEFAULT_TEMPERATURE_SCALE: f32 = 10.0;

/// Added to the partial-positive count so rows without class positives stay finite
pub const PARTIAL_COUNT_EPSILON: f32 = 1e-3;

/// Below this many rows the per-row work is too small to hand to rayon
const PARALLEL_ROWS: usize = 64;

/// Per-row contrastive loss strategy.
pub trait ContrastiveLoss: Send + Sync {
    fn kind(&self) -> LossKind;

    fn name(&self) -> &'static str;

    /// Loss of one row of shifted logits.
    ///
    /// When `grad` is present it arrives zeroed and receives dL/dz for the row.
    fn row_loss(
        &self,
        relations: &[Relation],
        instance: usize,
        logits: &[f32],
        grad: Option<&mut [f32]>,
    ) -> f32;
}

/// Contributes nothing; the engine still validates its inputs
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLoss;

impl ContrastiveLoss for NoOpLoss {
    fn kind(&self) -> LossKind {
        LossKind::NoOp
    }

    fn name(&self) -> &'static str {
        "NoOpLoss"
    }

    fn row_loss(&self, _: &[Relation], _: usize, _: &[f32], _: Option<&mut [f32]>) -> f32 {
        0.0
    }
}

/// Cross-entropy toward the instance positive only
#[derive(Debug, Clone, Copy, Default)]
pub struct SimClrLoss;

impl ContrastiveLoss for SimClrLoss {
    fn kind(&self) -> LossKind {
        LossKind::SimClr
    }

    fn name(&self) -> &'static str {
        "SimClrLoss"
    }

    fn row_loss(
        &self,
        _relations: &[Relation],
        instance: usize,
        logits: &[f32],
        grad: Option<&mut [f32]>,
    ) -> f32 {
        instance_term(logits, instance, grad)
    }
}

/// Cross-entropy toward a uniform target over every positive (instance and class)
#[derive(Debug, Clone, Copy, Default)]
pub struct SupConLoss;

impl ContrastiveLoss for SupConLoss {
    fn kind(&self) -> LossKind {
        LossKind::SupCon
    }

    fn name(&self) -> &'static str {
        "SupConLoss"
    }

    fn row_loss(
        &self,
        relations: &[Relation],
        _instance: usize,
        logits: &[f32],
        grad: Option<&mut [f32]>,
    ) -> f32 {
        // a validated row always holds its instance positive
        let positives = relations.iter().filter(|r| r.is_positive()).count().max(1) as f32;
        let lse = log_sum_exp(logits);
        let target: f32 = relations
            .iter()
            .zip(logits)
            .filter(|(r, _)| r.is_positive())
            .map(|(_, z)| z)
            .sum::<f32>()
            / positives;

        if let Some(grad) = grad {
            for ((g, &z), r) in grad.iter_mut().zip(logits).zip(relations) {
                *g += (z - lse).exp();
                if r.is_positive() {
                    *g -= 1.0 / positives;
                }
            }
        }

        lse - target
    }
}

/// Partial-class cross-entropy plus the instance term.
///
/// Each class positive `j` competes only against the negatives:
/// `log p_j = z_j - log(sum_neg exp(z_k) + exp(z_j))`, so other class
/// positives and the instance positive never appear in its denominator.
/// The mean of `-log p_j` over class positives is added, unweighted, to the
/// [`SimClrLoss`] term.
#[derive(Debug, Clone, Copy)]
pub struct PartialSupConLoss {
    pub count_epsilon: f32,
}

impl Default for PartialSupConLoss {
    fn default() -> Self {
        Self { count_epsilon: PARTIAL_COUNT_EPSILON }
    }
}

impl ContrastiveLoss for PartialSupConLoss {
    fn kind(&self) -> LossKind {
        LossKind::PartialSupCon
    }

    fn name(&self) -> &'static str {
        "PartialSupConLoss"
    }

    fn row_loss(
        &self,
        relations: &[Relation],
        instance: usize,
        logits: &[f32],
        mut grad: Option<&mut [f32]>,
    ) -> f32 {
        let negative_lse = masked_log_sum_exp(logits, |k| relations[k] == Relation::Negative);
        let partial_count = relations
            .iter()
            .filter(|&&r| r == Relation::ClassPositive)
            .count();
        let weight = 1.0 / (partial_count as f32 + self.count_epsilon);

        let mut partial = 0.0f32;
        // log of sum_j 1 / (sum_neg exp(z_k) + exp(z_j)), for the negatives' gradient
        let mut log_inverse_sum = f32::NEG_INFINITY;
        for (j, (&r, &z)) in relations.iter().zip(logits).enumerate() {
            if r != Relation::ClassPositive {
                continue;
            }
            let denominator = log_add_exp(negative_lse, z);
            partial -= z - denominator;
            log_inverse_sum = log_add_exp(log_inverse_sum, -denominator);
            if let Some(g) = grad.as_deref_mut() {
                g[j] -= weight * (negative_lse - denominator).exp();
            }
        }
        partial *= weight;

        if let Some(g) = grad.as_deref_mut() {
            if log_inverse_sum.is_finite() {
                for ((g, &z), &r) in g.iter_mut().zip(logits).zip(relations) {
                    if r == Relation::Negative {
                        *g += weight * (z + log_inverse_sum).exp();
                    }
                }
            }
        }

        partial + instance_term(logits, instance, grad)
    }
}

/// `lse(z) - z[instance]`, accumulating `softmax(z) - onehot` into `grad`
fn instance_term(logits: &[f32], instance: usize, grad: Option<&mut [f32]>) -> f32 {
    let lse = log_sum_exp(logits);
    if let Some(grad) = grad {
        for (g, &z) in grad.iter_mut().zip(logits) {
            *g += (z - lse).exp();
        }
        grad[instance] -= 1.0;
    }
    lse - logits[instance]
}

/// Everything the step needs from one contrastive evaluation
#[derive(Debug, Clone)]
pub struct ContrastiveBatch {
    pub relations: RelationTensor,
    pub similarities: SimilarityMatrix,
    /// Gathered second views, detached, `[M, D]`
    pub keys: Tensor<2>,
    /// Unreduced loss of each local example
    pub losses: Vec<f32>,
}

/// Applies one contrastive variant to relation/similarity pairs
pub struct ContrastiveEngine {
    loss: Box<dyn ContrastiveLoss>,
    temperature_scale: f32,
}

impl std::fmt::Debug for ContrastiveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContrastiveEngine")
            .field("loss", &self.loss.name())
            .field("temperature_scale", &self.temperature_scale)
            .finish()
    }
}

impl ContrastiveEngine {
    pub fn new(kind: LossKind, temperature_scale: f32) -> ContrastResult<Self> {
        Self::with_loss(kind.build(), temperature_scale)
    }

    pub fn with_loss(loss: Box<dyn ContrastiveLoss>, temperature_scale: f32) -> ContrastResult<Self> {
        if !temperature_scale.is_finite() || temperature_scale <= 0.0 {
            return Err(ContrastError::ConfigurationError(format!(
                "temperature scale must be positive and finite, got {}",
                temperature_scale
            )));
        }
        Ok(Self { loss, temperature_scale })
    }

    pub fn kind(&self) -> LossKind {
        self.loss.kind()
    }

    pub fn temperature_scale(&self) -> f32 {
        self.temperature_scale
    }

    /// Unreduced per-example losses, length `relations.rows()`
    pub fn forward(
        &self,
        relations: &RelationTensor,
        similarities: &SimilarityMatrix,
    ) -> ContrastResult<Vec<f32>> {
        self.check_shapes(relations, similarities)?;

        let eval_row = |i: usize| {
            let logits = self.shifted_logits(similarities.row(i));
            self.loss
                .row_loss(relations.row(i), relations.instance_index(i), &logits, None)
        };
        let losses: Vec<f32> = if relations.rows() >= PARALLEL_ROWS {
            (0..relations.rows()).into_par_iter().map(&eval_row).collect()
        } else {
            (0..relations.rows()).map(&eval_row).collect()
        };

        check_finite("loss output", &losses)?;
        Ok(losses)
    }

    /// Per-example losses together with dL/dS, where `upstream[i]` weights row `i`.
    ///
    /// The gradient is taken with respect to the unscaled similarities.
    pub fn forward_backward(
        &self,
        relations: &RelationTensor,
        similarities: &SimilarityMatrix,
        upstream: &[f32],
    ) -> ContrastResult<(Vec<f32>, Tensor<2>)> {
        self.check_shapes(relations, similarities)?;
        if upstream.len() != relations.rows() {
            return Err(ContrastError::shape_mismatch(
                "upstream gradient",
                &relations.rows().to_string(),
                &upstream.len().to_string(),
            ));
        }

        let (rows, cols) = (relations.rows(), relations.cols());
        let mut grad = vec![0.0f32; rows * cols];
        let eval_row = |(i, g): (usize, &mut [f32])| {
            let logits = self.shifted_logits(similarities.row(i));
            let loss = self.loss.row_loss(
                relations.row(i),
                relations.instance_index(i),
                &logits,
                Some(&mut *g),
            );
            let factor = upstream[i] * self.temperature_scale;
            g.iter_mut().for_each(|v| *v *= factor);
            loss
        };
        let losses: Vec<f32> = if rows >= PARALLEL_ROWS {
            grad.par_chunks_mut(cols.max(1)).enumerate().map(&eval_row).collect()
        } else {
            grad.chunks_mut(cols.max(1)).enumerate().map(&eval_row).collect()
        };

        check_finite("loss output", &losses)?;
        check_finite("loss gradient", &grad)?;
        Ok((losses, Tensor::from_vec(grad, Shape::new([rows, cols]))?))
    }

    pub fn backward(
        &self,
        relations: &RelationTensor,
        similarities: &SimilarityMatrix,
        upstream: &[f32],
    ) -> ContrastResult<Tensor<2>> {
        Ok(self.forward_backward(relations, similarities, upstream)?.1)
    }

    /// Gather the second views, build relations and similarities, and evaluate.
    ///
    /// Collective: every rank of `collector` must call this in the same step.
    pub fn from_views(
        &self,
        labels: &[i64],
        queries: &Tensor<2>,
        keys: &Tensor<2>,
        collector: &dyn GlobalCollector,
    ) -> ContrastResult<ContrastiveBatch> {
        if queries.rows() != labels.len() || keys.rows() != labels.len() {
            return Err(ContrastError::shape_mismatch(
                "view pair",
                &format!("{} rows in both views", labels.len()),
                &format!("{} and {}", queries.rows(), keys.rows()),
            ));
        }

        let global_keys = collector.all_gather(keys)?;
        let global_labels = collector.all_gather_labels(labels)?;
        let relations = RelationTensor::from_labels(
            labels,
            &global_labels,
            &collector.pair_indices(labels.len()),
        )?;
        let similarities = SimilarityMatrix::compute(queries, &global_keys)?;
        let losses = self.forward(&relations, &similarities)?;

        Ok(ContrastiveBatch {
            relations,
            similarities,
            keys: global_keys,
            losses,
        })
    }

    fn check_shapes(
        &self,
        relations: &RelationTensor,
        similarities: &SimilarityMatrix,
    ) -> ContrastResult<()> {
        if relations.rows() != similarities.rows() || relations.cols() != similarities.cols() {
            return Err(ContrastError::shape_mismatch(
                "similarities",
                &format!("[{}, {}] like the relation tensor", relations.rows(), relations.cols()),
                &similarities.as_tensor().shape().to_string(),
            ));
        }
        Ok(())
    }

    fn shifted_logits(&self, similarities: &[f32]) -> Vec<f32> {
        let max = similarities
            .iter()
            .map(|s| s * self.temperature_scale)
            .fold(f32::NEG_INFINITY, f32::max);
        similarities
            .iter()
            .map(|s| s * self.temperature_scale - max)
            .collect()
    }
}

fn check_finite(stage: &str, values: &[f32]) -> ContrastResult<()> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(i) => Err(ContrastError::numerical(
            stage,
            &format!("non-finite value {} at {}", values[i], i),
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        contrastive::PairIndex,
        distributed::{IdentityCollector, ReplicaGroup},
        tensor::ops::l2_normalize_rows,
    };

    fn random_unit_rows(rng: &mut StdRng, n: usize, d: usize) -> Tensor<2> {
        let data = (0..n * d).map(|_| rng.gen_range(-1.0..1.0)).collect();
        l2_normalize_rows(&Tensor::from_vec(data, Shape::new([n, d])).unwrap()).0
    }

    fn sims(values: &[f32], rows: usize) -> SimilarityMatrix {
        let cols = values.len() / rows;
        SimilarityMatrix::from_tensor(Tensor::from_vec(values.to_vec(), Shape::new([rows, cols])).unwrap())
            .unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() <= tol, "{:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn test_supcon_hand_computed_pairs() {
        let labels = [0, 0, 1, 1];
        let view = Tensor::from_rows(&[
            vec![1.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.0, 1.0],
        ])
        .unwrap();
        let engine = ContrastiveEngine::new(LossKind::SupCon, 10.0).unwrap();
        let batch = engine.from_views(&labels, &view, &view, &IdentityCollector).unwrap();

        // each row: two positives at logit 0, two negatives at -10
        let expected = (2.0f64 + 2.0 * (-10.0f64).exp()).ln() as f32;
        for loss in batch.losses {
            assert!((loss - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_single_worker_matches_hand_reference() {
        let labels = [3, 5];
        let queries = Tensor::from_rows(&[vec![0.6, 0.8], vec![1.0, 0.0]]).unwrap();
        let keys = Tensor::from_rows(&[vec![0.0, 1.0], vec![0.8, 0.6]]).unwrap();
        let engine = ContrastiveEngine::new(LossKind::SimClr, 10.0).unwrap();
        let batch = engine.from_views(&labels, &queries, &keys, &IdentityCollector).unwrap();

        let reference = |s: [f64; 2], p: usize| {
            let z = [s[0] * 10.0, s[1] * 10.0];
            let lse = (z[0].exp() + z[1].exp()).ln();
            (lse - z[p]) as f32
        };
        assert_close(
            &batch.losses,
            &[reference([0.8, 0.96], 0), reference([0.0, 0.8], 1)],
            1e-5,
        );
        assert_eq!(batch.relations.codes(), vec![2, 0, 0, 2]);
    }

    #[test]
    fn test_exact_unit_cosine_is_finite() {
        let relations = RelationTensor::from_codes(&[2, 1, 1, 2], 2, 2).unwrap();
        let similarities = sims(&[1.0, 1.0, 1.0, 1.0 + 0.5 * crate::contrastive::COSINE_TOLERANCE], 2);
        for kind in LossKind::ALL {
            let engine = ContrastiveEngine::new(kind, 10.0).unwrap();
            let losses = engine.forward(&relations, &similarities).unwrap();
            assert!(losses.iter().all(|l| l.is_finite()), "{}", kind);
        }
    }

    #[test]
    fn test_distinct_labels_reduce_to_simclr() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let n = rng.gen_range(2..12);
            let labels: Vec<i64> = (0..n as i64).collect();
            let view1 = random_unit_rows(&mut rng, n, 8);
            let view2 = random_unit_rows(&mut rng, n, 8);

            let evaluate = |kind| {
                ContrastiveEngine::new(kind, 10.0)
                    .unwrap()
                    .from_views(&labels, &view1, &view2, &IdentityCollector)
                    .unwrap()
                    .losses
            };
            let simclr = evaluate(LossKind::SimClr);
            assert_close(&evaluate(LossKind::SupCon), &simclr, 1e-6);
            assert_close(&evaluate(LossKind::PartialSupCon), &simclr, 1e-6);
        }
    }

    #[test]
    fn test_partial_supcon_hand_computed() {
        // one row: instance, class positive, two negatives
        let relations = RelationTensor::from_codes(&[2, 1, 0, 0], 1, 4).unwrap();
        let s = [0.9f64, 0.5, 0.2, -0.3];
        let engine = ContrastiveEngine::new(LossKind::PartialSupCon, 1.0).unwrap();
        let loss = engine.forward(&relations, &sims(&s.map(|v| v as f32), 1)).unwrap()[0];

        let e: Vec<f64> = s.iter().map(|v| v.exp()).collect();
        let partial = -(1.0 / (1.0 + 1e-3)) * (s[1] - (e[2] + e[3] + e[1]).ln());
        let instance = e.iter().sum::<f64>().ln() - s[0];
        assert!((loss as f64 - (partial + instance)).abs() < 1e-5);
    }

    #[test]
    fn test_noop_validates_and_returns_zeros() {
        let engine = ContrastiveEngine::new(LossKind::NoOp, 10.0).unwrap();
        let relations = RelationTensor::from_codes(&[2, 0, 0, 2], 2, 2).unwrap();
        assert_eq!(engine.forward(&relations, &sims(&[0.1, 0.2, 0.3, 0.4], 2)).unwrap(), vec![0.0, 0.0]);

        let err = engine.forward(&relations, &sims(&[0.1, 0.2, 0.3], 1)).unwrap_err();
        assert!(matches!(err, ContrastError::ShapeMismatch(_)));
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        let err = RelationTensor::from_codes(&[2, 2, 0, 0, 2, 0], 2, 3).unwrap_err();
        assert!(matches!(err, ContrastError::InvalidRelation(_)));

        let nan = Tensor::from_vec(vec![0.5, f32::NAN], Shape::new([1, 2])).unwrap();
        let err = SimilarityMatrix::from_tensor(nan).unwrap_err();
        assert!(matches!(err, ContrastError::NumericalInstability(_)));

        assert!(ContrastiveEngine::new(LossKind::SupCon, 0.0).is_err());
        assert!(ContrastiveEngine::new(LossKind::SupCon, f32::NAN).is_err());
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let relations = RelationTensor::from_codes(
            &[2, 1, 0, 1, 0, 0, 1, 2, 0, 0, 1, 0, 0, 0, 2, 1, 0, 0],
            3,
            6,
        )
        .unwrap();
        let values: Vec<f32> = (0..18).map(|_| rng.gen_range(-0.9..0.9)).collect();
        let upstream = [1.0, 0.5, 2.0];

        for kind in LossKind::ALL {
            let engine = ContrastiveEngine::new(kind, 2.0).unwrap();
            let grad = engine.backward(&relations, &sims(&values, 3), &upstream).unwrap();
            let weighted = |v: &[f32]| -> f64 {
                let losses = engine.forward(&relations, &sims(v, 3)).unwrap();
                losses.iter().zip(&upstream).map(|(l, u)| (*l as f64) * (*u as f64)).sum()
            };

            let h = 1e-3;
            for k in 0..values.len() {
                let (mut plus, mut minus) = (values.clone(), values.clone());
                plus[k] += h;
                minus[k] -= h;
                let numeric = (weighted(&plus) - weighted(&minus)) / (2.0 * h as f64);
                let analytic = grad.as_slice()[k] as f64;
                assert!(
                    (numeric - analytic).abs() < 2e-2,
                    "{} cell {}: numeric {} analytic {}",
                    kind,
                    k,
                    numeric,
                    analytic
                );
            }
        }
    }

    #[test]
    fn test_replicas_match_single_worker_on_full_batch() {
        let mut rng = StdRng::seed_from_u64(3);
        let (world, local) = (2, 4);
        let labels: Vec<i64> = (0..world * local).map(|_| rng.gen_range(0..3)).collect();
        let view1 = random_unit_rows(&mut rng, world * local, 6);
        let view2 = random_unit_rows(&mut rng, world * local, 6);

        let engine = ContrastiveEngine::new(LossKind::PartialSupCon, 10.0).unwrap();
        let single = engine
            .from_views(&labels, &view1, &view2, &IdentityCollector)
            .unwrap()
            .losses;

        let group = ReplicaGroup::new(world, Duration::from_secs(5)).unwrap();
        let replicated: Vec<f32> = group
            .run(|collector| {
                let start = collector.rank() * local;
                engine
                    .from_views(
                        &labels[start..start + local],
                        &view1.slice_rows(start, local)?,
                        &view2.slice_rows(start, local)?,
                        &collector,
                    )
                    .map(|batch| batch.losses)
            })
            .into_iter()
            .flat_map(|r| r.unwrap())
            .collect();

        assert_close(&replicated, &single, 1e-6);
    }

    #[test]
    fn test_large_batch_uses_parallel_rows_consistently() {
        let mut rng = StdRng::seed_from_u64(5);
        let n = PARALLEL_ROWS + 8;
        let labels: Vec<i64> = (0..n).map(|_| rng.gen_range(0..10)).collect();
        let relations =
            RelationTensor::from_labels(&labels, &labels, &PairIndex::identity(n)).unwrap();
        let view = random_unit_rows(&mut rng, n, 16);
        let similarities = SimilarityMatrix::compute(&view, &view).unwrap();

        let engine = ContrastiveEngine::new(LossKind::SupCon, 10.0).unwrap();
        let forward = engine.forward(&relations, &similarities).unwrap();
        let (joint, grad) = engine
            .forward_backward(&relations, &similarities, &vec![1.0; n])
            .unwrap();
        assert_eq!(forward, joint);
        assert_eq!(grad.shape().as_slice(), &[n, n]);
    }
}
