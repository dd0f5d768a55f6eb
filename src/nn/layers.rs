//! Neural network layers

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ContrastError, ContrastResult},
    tensor::{Shape, Tensor},
};

/// Dense layer `y = x W^T + b` with `W: [out, in]`
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    weight: Tensor<2>,
    bias: Vec<f32>,
}

/// Gradients of a [`Linear`] layer for one batch
#[derive(Debug, Clone, PartialEq)]
pub struct LinearGrads {
    pub weight: Tensor<2>,
    pub bias: Vec<f32>,
    pub input: Tensor<2>,
}

impl Linear {
    /// Glorot-uniform weights and zero bias
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (in_features + out_features).max(1) as f32).sqrt();
        let data = (0..in_features * out_features)
            .map(|_| rng.gen_range(-limit..=limit))
            .collect::<Vec<f32>>();
        Self {
            weight: Tensor::from_vec(data, Shape::new([out_features, in_features]))
                .unwrap_or_else(|_| Tensor::zeros(Shape::new([out_features, in_features]))),
            bias: vec![0.0; out_features],
        }
    }

    pub fn from_parts(weight: Tensor<2>, bias: Vec<f32>) -> ContrastResult<Self> {
        if bias.len() != weight.rows() {
            return Err(ContrastError::shape_mismatch(
                "linear bias",
                &weight.rows().to_string(),
                &bias.len().to_string(),
            ));
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.cols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.rows()
    }

    pub fn weight(&self) -> &Tensor<2> {
        &self.weight
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.numel() + self.bias.len()
    }

    /// Weight then bias, in the order [`LinearGrads::parameter_slices`] uses
    pub fn parameters_mut(&mut self) -> [&mut [f32]; 2] {
        [self.weight.as_mut_slice(), self.bias.as_mut_slice()]
    }

    pub fn forward(&self, input: &Tensor<2>) -> ContrastResult<Tensor<2>> {
        let mut output = input.matmul_transposed(&self.weight)?;
        let out = self.out_features();
        if out > 0 {
            for row in output.as_mut_slice().chunks_mut(out) {
                for (y, b) in row.iter_mut().zip(&self.bias) {
                    *y += b;
                }
            }
        }
        Ok(output)
    }

    pub fn backward(&self, input: &Tensor<2>, grad_output: &Tensor<2>) -> ContrastResult<LinearGrads> {
        if grad_output.cols() != self.out_features() || grad_output.rows() != input.rows() {
            return Err(ContrastError::shape_mismatch(
                "linear grad_output",
                &format!("[{}, {}]", input.rows(), self.out_features()),
                &grad_output.shape().to_string(),
            ));
        }

        let mut bias = vec![0.0f32; self.out_features()];
        for row in grad_output.row_iter() {
            for (b, g) in bias.iter_mut().zip(row) {
                *b += g;
            }
        }

        Ok(LinearGrads {
            weight: grad_output.transpose_matmul(input)?,
            bias,
            input: grad_output.matmul(&self.weight)?,
        })
    }
}

impl LinearGrads {
    pub fn parameter_slices(&self) -> [&[f32]; 2] {
        [self.weight.as_slice(), &self.bias]
    }
}

/// Fixed feature extractor in front of the trainable heads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackboneKind {
    /// Raw inputs are the features
    Identity,
    /// Frozen random linear map followed by ReLU
    RandomProjection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backbone {
    Identity { dim: usize },
    RandomProjection(Linear),
}

impl Backbone {
    pub fn new<R: Rng + ?Sized>(
        kind: BackboneKind,
        input_dim: usize,
        feature_dim: usize,
        rng: &mut R,
    ) -> Self {
        match kind {
            BackboneKind::Identity => Backbone::Identity { dim: input_dim },
            BackboneKind::RandomProjection => {
                Backbone::RandomProjection(Linear::new(input_dim, feature_dim, rng))
            }
        }
    }

    pub fn kind(&self) -> BackboneKind {
        match self {
            Backbone::Identity { .. } => BackboneKind::Identity,
            Backbone::RandomProjection(_) => BackboneKind::RandomProjection,
        }
    }

    pub fn input_dim(&self) -> usize {
        match self {
            Backbone::Identity { dim } => *dim,
            Backbone::RandomProjection(linear) => linear.in_features(),
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            Backbone::Identity { dim } => *dim,
            Backbone::RandomProjection(linear) => linear.out_features(),
        }
    }

    /// Features are never differentiated, so the result is always detached
    pub fn forward(&self, input: &Tensor<2>) -> ContrastResult<Tensor<2>> {
        if input.cols() != self.input_dim() {
            return Err(ContrastError::shape_mismatch(
                "backbone input",
                &format!("[_, {}]", self.input_dim()),
                &input.shape().to_string(),
            ));
        }
        match self {
            Backbone::Identity { .. } => Ok(input.detach()),
            Backbone::RandomProjection(linear) => Ok(linear.forward(input)?.map(|v| v.max(0.0)).detach()),
        }
    }
}
