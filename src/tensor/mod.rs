//! Dense f32 tensors and the row-wise kernels the losses are built on
//!
//! Tensors are row-major with a const-generic rank. Storage is reference
//! counted so detaching or gathering a tensor never copies until written.

pub mod core;
pub mod ops;

// Re-export main types for convenience
pub use self::core::{dot, Shape, Tensor};
pub use self::ops::{l2_normalize_backward, l2_normalize_rows, log_add_exp, log_sum_exp, masked_log_sum_exp, softmax_into};
