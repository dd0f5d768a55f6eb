//! Query/key similarity matrices over the global batch

use crate::{
    error::{ContrastError, ContrastResult},
    tensor::Tensor,
};

/// Slack allowed above 1.0 for cosine similarities of unit vectors
pub const COSINE_TOLERANCE: f32 = 1e-2;

/// `[N, M]` cosine similarities of local queries against gathered keys.
///
/// Values are unscaled; the loss engine applies the temperature scale.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatrix {
    values: Tensor<2>,
}

impl SimilarityMatrix {
    /// `queries @ keys^T`. The keys are detached before the product.
    pub fn compute(queries: &Tensor<2>, keys: &Tensor<2>) -> ContrastResult<Self> {
        if !queries.all_finite() {
            return Err(ContrastError::numerical("queries", "features not finite"));
        }
        if !keys.all_finite() {
            return Err(ContrastError::numerical("keys", "features not finite"));
        }
        let values = queries.matmul_transposed(&keys.detach())?;
        Self::from_tensor(values)
    }

    /// Wrap precomputed similarities, checking finiteness and the cosine bound
    pub fn from_tensor(values: Tensor<2>) -> ContrastResult<Self> {
        for (k, &v) in values.as_slice().iter().enumerate() {
            if !v.is_finite() {
                return Err(ContrastError::numerical(
                    "similarities",
                    &format!("non-finite value {} at {:?}", v, position(k, values.cols())),
                ));
            }
            if v > 1.0 + COSINE_TOLERANCE {
                return Err(ContrastError::numerical(
                    "similarities",
                    &format!(
                        "cosine {} at {:?} exceeds 1 + {}; are the features normalized?",
                        v,
                        position(k, values.cols()),
                        COSINE_TOLERANCE
                    ),
                ));
            }
        }
        Ok(Self { values })
    }

    pub fn rows(&self) -> usize {
        self.values.rows()
    }

    pub fn cols(&self) -> usize {
        self.values.cols()
    }

    pub fn row(&self, i: usize) -> &[f32] {
        self.values.row(i)
    }

    pub fn as_tensor(&self) -> &Tensor<2> {
        &self.values
    }
}

fn position(flat: usize, cols: usize) -> (usize, usize) {
    (flat / cols.max(1), flat % cols.max(1))
}
