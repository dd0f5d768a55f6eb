//! Optimizers for the trainable heads

use serde::{Deserialize, Serialize};

use crate::error::{ContrastError, ContrastResult};

/// Optimizer over a fixed list of flat parameter slices
pub trait Optimizer: Send + Sync {
    /// Apply one update. `gradients` is the concatenation of every slice's gradient.
    fn step(&mut self, parameters: &mut [&mut [f32]], gradients: &[f32]) -> ContrastResult<()>;
    fn get_lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
    fn state(&self) -> OptimizerState;
}

/// Resumable optimizer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub learning_rate: f32,
    pub velocity: Vec<f32>,
}

/// SGD with classical momentum and L2 weight decay:
/// `v = momentum * v - lr * (g + weight_decay * w)`, then `w += v`.
#[derive(Debug, Clone, PartialEq)]
pub struct SGDOptimizer {
    momentum: f32,
    weight_decay: f32,
    learning_rate: f32,
    velocity: Vec<f32>,
}

impl SGDOptimizer {
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            momentum,
            weight_decay,
            learning_rate,
            velocity: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: OptimizerState) -> Self {
        self.learning_rate = state.learning_rate;
        self.velocity = state.velocity;
        self
    }
}

impl Optimizer for SGDOptimizer {
    fn step(&mut self, parameters: &mut [&mut [f32]], gradients: &[f32]) -> ContrastResult<()> {
        let total: usize = parameters.iter().map(|p| p.len()).sum();
        if gradients.len() != total {
            return Err(ContrastError::shape_mismatch(
                "optimizer gradients",
                &total.to_string(),
                &gradients.len().to_string(),
            ));
        }
        if self.velocity.len() != total {
            if !self.velocity.is_empty() {
                tracing::warn!(
                    expected = total,
                    found = self.velocity.len(),
                    "resetting optimizer velocity with mismatched length"
                );
            }
            self.velocity = vec![0.0; total];
        }

        let mut offset = 0;
        for param in parameters.iter_mut() {
            let len = param.len();
            let grads = &gradients[offset..offset + len];
            let velocity = &mut self.velocity[offset..offset + len];
            for ((w, &g), v) in param.iter_mut().zip(grads).zip(velocity.iter_mut()) {
                *v = self.momentum * *v - self.learning_rate * (g + self.weight_decay * *w);
                *w += *v;
            }
            offset += len;
        }
        Ok(())
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            learning_rate: self.learning_rate,
            velocity: self.velocity.clone(),
        }
    }
}
