//! Loss functions for contrastive training
//!
//! Contrastive variants operate on a validated relation tensor and a global
//! similarity matrix and return unreduced per-example values; the caller
//! reduces them over the global batch. Classification cross-entropy follows
//! the same per-example convention.

pub mod classification;
pub mod contrastive;

pub use classification::*;
pub use contrastive::*;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{ContrastError, ContrastResult};

/// Reduction types for loss functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    /// No reduction - return loss for each sample
    None,
    /// Mean over the local samples
    #[default]
    Mean,
    /// Sum over the local samples
    Sum,
    /// Sum divided by the global batch size, for data-parallel averaging
    GlobalMean { global_batch_size: usize },
}

/// Apply a reduction to per-example values. `None` keeps the vector.
pub fn apply_reduction(values: &[f32], reduction: Reduction) -> ContrastResult<Vec<f32>> {
    match reduction {
        Reduction::None => Ok(values.to_vec()),
        Reduction::Sum => Ok(vec![values.iter().sum()]),
        Reduction::Mean => {
            if values.is_empty() {
                return Err(ContrastError::InvalidInput("mean of an empty batch".to_string()));
            }
            Ok(vec![values.iter().sum::<f32>() / values.len() as f32])
        }
        Reduction::GlobalMean { global_batch_size } => {
            Ok(vec![compute_average_loss(values, global_batch_size)?])
        }
    }
}

/// Sum the local per-example values and divide by the global batch size.
///
/// Summing these over all replicas gives the true global mean, which a
/// per-replica mean of means does not when shards are averaged again.
pub fn compute_average_loss(values: &[f32], global_batch_size: usize) -> ContrastResult<f32> {
    if global_batch_size == 0 {
        return Err(ContrastError::InvalidInput("global batch size must be positive".to_string()));
    }
    Ok(values.iter().sum::<f32>() / global_batch_size as f32)
}

/// Contrastive loss variants, selected once from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LossKind {
    #[serde(rename = "no-op")]
    NoOp,
    #[serde(rename = "simclr")]
    SimClr,
    #[serde(rename = "supcon")]
    SupCon,
    #[serde(rename = "partial-supcon")]
    PartialSupCon,
}

impl LossKind {
    pub const ALL: [LossKind; 4] = [
        LossKind::NoOp,
        LossKind::SimClr,
        LossKind::SupCon,
        LossKind::PartialSupCon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LossKind::NoOp => "no-op",
            LossKind::SimClr => "simclr",
            LossKind::SupCon => "supcon",
            LossKind::PartialSupCon => "partial-supcon",
        }
    }

    /// Resolve into the concrete loss strategy
    pub fn build(self) -> Box<dyn ContrastiveLoss> {
        match self {
            LossKind::NoOp => Box::new(NoOpLoss),
            LossKind::SimClr => Box::new(SimClrLoss),
            LossKind::SupCon => Box::new(SupConLoss),
            LossKind::PartialSupCon => Box::new(PartialSupConLoss::default()),
        }
    }
}

impl Default for LossKind {
    fn default() -> Self {
        LossKind::SupCon
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossKind {
    type Err = ContrastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "no-op" | "noop" | "none" => Ok(LossKind::NoOp),
            "simclr" => Ok(LossKind::SimClr),
            "supcon" => Ok(LossKind::SupCon),
            "partial-supcon" | "supcon-pce" => Ok(LossKind::PartialSupCon),
            _ => Err(ContrastError::ConfigurationError(format!(
                "unknown contrastive loss '{}', expected one of {}",
                s,
                LossFactory::available_losses().join(", ")
            ))),
        }
    }
}

/// Loss function factory for creating contrastive losses by name
pub struct LossFactory;

impl LossFactory {
    /// Create a contrastive loss by name
    pub fn create(name: &str) -> ContrastResult<Box<dyn ContrastiveLoss>> {
        Ok(name.parse::<LossKind>()?.build())
    }

    /// List all available contrastive losses
    pub fn available_losses() -> Vec<&'static str> {
        LossKind::ALL.iter().map(LossKind::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_factory() {
        let loss = LossFactory::create("partial-supcon").unwrap();
        assert_eq!(loss.kind(), LossKind::PartialSupCon);
        assert_eq!(loss.name(), "PartialSupConLoss");
        assert!(LossFactory::create("triplet").is_err());
    }

    #[test]
    fn test_available_losses() {
        let losses = LossFactory::available_losses();
        assert_eq!(losses, vec!["no-op", "simclr", "supcon", "partial-supcon"]);
    }

    #[test]
    fn test_loss_kind_serde_names() {
        for kind in LossKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
            let back: LossKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
        assert_eq!("supcon-pce".parse::<LossKind>().unwrap(), LossKind::PartialSupCon);
    }

    #[test]
    fn test_global_mean_sums_to_true_mean() {
        // two replicas, uneven losses: summing per-replica averages gives the global mean
        let a = compute_average_loss(&[1.0, 3.0], 4).unwrap();
        let b = compute_average_loss(&[5.0, 7.0], 4).unwrap();
        assert!((a + b - 4.0).abs() < 1e-6);
        assert!(compute_average_loss(&[1.0], 0).is_err());
    }

    #[test]
    fn test_reductions() {
        let values = [1.0, 2.0, 3.0];
        assert_eq!(apply_reduction(&values, Reduction::None).unwrap(), values.to_vec());
        assert_eq!(apply_reduction(&values, Reduction::Sum).unwrap(), vec![6.0]);
        assert_eq!(apply_reduction(&values, Reduction::Mean).unwrap(), vec![2.0]);
        assert_eq!(
            apply_reduction(&values, Reduction::GlobalMean { global_batch_size: 6 }).unwrap(),
            vec![1.0]
        );
        assert_eq!(Reduction::default(), Reduction::Mean);
    }
}
