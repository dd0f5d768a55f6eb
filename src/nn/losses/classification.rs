//! Classification losses for the linear head

use super::{apply_reduction, Reduction};
use crate::{
    error::{ContrastError, ContrastResult},
    tensor::{
        ops::{log_sum_exp, softmax_into},
        Shape, Tensor,
    },
};

/// Sparse softmax cross-entropy from unnormalized logits
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// `lse(logits_i) - logits_i[label_i]` for every row
    pub fn per_example(&self, logits: &Tensor<2>, labels: &[i64]) -> ContrastResult<Vec<f32>> {
        check_labels(logits, labels)?;
        Ok(logits
            .row_iter()
            .zip(labels)
            .map(|(row, &label)| log_sum_exp(row) - row[label as usize])
            .collect())
    }

    /// Reduced loss according to the configured reduction
    pub fn forward(&self, logits: &Tensor<2>, labels: &[i64]) -> ContrastResult<Vec<f32>> {
        apply_reduction(&self.per_example(logits, labels)?, self.reduction)
    }

    /// Per-example losses and dL/dlogits, where `upstream[i]` weights row `i`
    pub fn forward_backward(
        &self,
        logits: &Tensor<2>,
        labels: &[i64],
        upstream: &[f32],
    ) -> ContrastResult<(Vec<f32>, Tensor<2>)> {
        check_labels(logits, labels)?;
        if upstream.len() != labels.len() {
            return Err(ContrastError::shape_mismatch(
                "upstream gradient",
                &labels.len().to_string(),
                &upstream.len().to_string(),
            ));
        }

        let classes = logits.cols();
        let mut losses = Vec::with_capacity(labels.len());
        let mut grad = vec![0.0f32; logits.numel()];
        let rows = logits.row_iter().zip(grad.chunks_mut(classes.max(1)));
        for (((row, out), &label), &weight) in rows.zip(labels).zip(upstream) {
            let label = label as usize;
            let lse = softmax_into(row, out);
            losses.push(lse - row[label]);
            out[label] -= 1.0;
            out.iter_mut().for_each(|g| *g *= weight);
        }

        Ok((losses, Tensor::from_vec(grad, Shape::new([labels.len(), classes]))?))
    }
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self::new(Reduction::Mean)
    }
}

/// 1.0 where the arg-max class equals the label, else 0.0
pub fn accuracy_per_example(logits: &Tensor<2>, labels: &[i64]) -> ContrastResult<Vec<f32>> {
    check_labels(logits, labels)?;
    Ok(logits
        .row_iter()
        .zip(labels)
        .map(|(row, &label)| if argmax(row) == label as usize { 1.0 } else { 0.0 })
        .collect())
}

/// First index of the largest value
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max {
                (i, v)
            } else {
                (best, max)
            }
        })
        .0
}

fn check_labels(logits: &Tensor<2>, labels: &[i64]) -> ContrastResult<()> {
    if logits.rows() != labels.len() {
        return Err(ContrastError::shape_mismatch(
            "classifier logits",
            &format!("{} rows", labels.len()),
            &logits.shape().to_string(),
        ));
    }
    if let Some(bad) = labels.iter().find(|&&l| l < 0 || l as usize >= logits.cols()) {
        return Err(ContrastError::InvalidInput(format!(
            "label {} outside {} classes",
            bad,
            logits.cols()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits() -> Tensor<2> {
        Tensor::from_rows(&[vec![2.0, 0.0, 0.0], vec![0.0, 0.0, 0.0]]).unwrap()
    }

    #[test]
    fn test_cross_entropy_values() {
        let loss = CrossEntropyLoss::new(Reduction::None);
        let values = loss.per_example(&logits(), &[0, 2]).unwrap();
        let expected0 = (2.0f32.exp() + 2.0).ln() - 2.0;
        assert!((values[0] - expected0).abs() < 1e-6);
        assert!((values[1] - 3.0f32.ln()).abs() < 1e-6);

        let mean = CrossEntropyLoss::default().forward(&logits(), &[0, 2]).unwrap();
        assert!((mean[0] - (expected0 + 3.0f32.ln()) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_gradient() {
        let loss = CrossEntropyLoss::default();
        let (_, grad) = loss.forward_backward(&logits(), &[0, 2], &[1.0, 0.5]).unwrap();
        // rows of softmax - onehot sum to zero
        for row in grad.row_iter() {
            assert!(row.iter().sum::<f32>().abs() < 1e-6);
        }
        assert!((grad.row(1)[2] - 0.5 * (1.0 / 3.0 - 1.0)).abs() < 1e-6);
        let p0 = 2.0f32.exp() / (2.0f32.exp() + 2.0);
        assert!((grad.row(0)[0] - (p0 - 1.0)).abs() < 1e-6);
        assert!((grad.row(0)[1] - (1.0 - p0) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_forward_backward_losses_match_per_example() {
        let loss = CrossEntropyLoss::new(Reduction::None);
        let (values, _) = loss.forward_backward(&logits(), &[1, 0], &[1.0, 1.0]).unwrap();
        assert_eq!(values, loss.per_example(&logits(), &[1, 0]).unwrap());
    }

    #[test]
    fn test_large_logits_stay_finite() {
        let big = Tensor::from_rows(&[vec![1000.0, -1000.0]]).unwrap();
        let values = CrossEntropyLoss::default().per_example(&big, &[1]).unwrap();
        assert!((values[0] - 2000.0).abs() < 1e-2);
    }

    #[test]
    fn test_accuracy() {
        let acc = accuracy_per_example(&logits(), &[0, 1]).unwrap();
        // ties resolve to the first class
        assert_eq!(acc, vec![1.0, 0.0]);
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), 1);
    }

    #[test]
    fn test_label_validation() {
        assert!(matches!(
            CrossEntropyLoss::default().per_example(&logits(), &[0, 3]),
            Err(ContrastError::InvalidInput(_))
        ));
        assert!(matches!(
            accuracy_per_example(&logits(), &[0]),
            Err(ContrastError::ShapeMismatch(_))
        ));
    }
}
