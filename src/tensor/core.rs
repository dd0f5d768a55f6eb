//! Core tensor types and fundamental operations

use std::{
    fmt::{self, Debug, Display},
    sync::Arc,
};

use rayon::prelude::*;

use crate::error::{ContrastError, ContrastResult};

/// Row count above which matrix products are split across the rayon pool
const PARALLEL_ROWS: usize = 64;

/// Compile-time rank with const generics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape<const DIMS: usize> {
    pub dims: [usize; DIMS],
}

impl<const DIMS: usize> Shape<DIMS> {
    pub fn new(dims: [usize; DIMS]) -> Self {
        Self { dims }
    }

    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_valid(&self) -> bool {
        self.dims.iter().all(|&d| d > 0)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }
}

impl Shape<2> {
    pub fn rows(&self) -> usize { self.dims[0] }
    pub fn cols(&self) -> usize { self.dims[1] }
}

impl<const DIMS: usize> Display for Shape<DIMS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.dims.iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", "))
    }
}

/// Dense row-major f32 tensor.
///
/// Storage is shared between clones; writes go through copy-on-write. The
/// `requires_grad` flag marks whether a tensor participates in the backward
/// pass. Gathered keys are always detached.
#[derive(Clone, PartialEq)]
pub struct Tensor<const DIMS: usize> {
    data: Arc<Vec<f32>>,
    shape: Shape<DIMS>,
    requires_grad: bool,
}

impl<const DIMS: usize> Tensor<DIMS> {
    /// Create from a vector, checking the length against the shape
    pub fn from_vec(data: Vec<f32>, shape: Shape<DIMS>) -> ContrastResult<Self> {
        if data.len() != shape.total_elements() {
            return Err(ContrastError::shape_mismatch(
                "tensor data",
                &format!("{} elements for shape {}", shape.total_elements(), shape),
                &format!("{} elements", data.len()),
            ));
        }

        Ok(Self {
            data: Arc::new(data),
            shape,
            requires_grad: false,
        })
    }

    pub fn zeros(shape: Shape<DIMS>) -> Self {
        Self {
            data: Arc::new(vec![0.0; shape.total_elements()]),
            shape,
            requires_grad: false,
        }
    }

    /// Get tensor shape
    pub fn shape(&self) -> Shape<DIMS> {
        self.shape
    }

    /// Get number of elements
    pub fn numel(&self) -> usize {
        self.shape.total_elements()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access; clones the storage if it is shared
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.as_ref().clone()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn with_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    /// Stop-gradient copy sharing the same storage
    pub fn detach(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            shape: self.shape,
            requires_grad: false,
        }
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            data: Arc::new(self.data.iter().map(|&v| f(v)).collect()),
            shape: self.shape,
            requires_grad: self.requires_grad,
        }
    }
}

impl Tensor<2> {
    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    pub fn cols(&self) -> usize {
        self.shape.cols()
    }

    pub fn row(&self, index: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[index * cols..(index + 1) * cols]
    }

    pub fn row_iter(&self) -> impl Iterator<Item = &[f32]> {
        // chunks(0) panics, so zero-width tensors yield empty rows explicitly
        let cols = self.cols().max(1);
        self.data.chunks(cols).take(self.rows())
    }

    /// Build an `[rows.len(), width]` tensor from equally sized rows
    pub fn from_rows(rows: &[Vec<f32>]) -> ContrastResult<Self> {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * width);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(ContrastError::shape_mismatch(
                    &format!("row {}", i),
                    &width.to_string(),
                    &row.len().to_string(),
                ));
            }
            data.extend_from_slice(row);
        }
        Self::from_vec(data, Shape::new([rows.len(), width]))
    }

    /// `self @ other^T` for `self: [N, D]`, `other: [M, D]`, giving `[N, M]`
    pub fn matmul_transposed(&self, other: &Tensor<2>) -> ContrastResult<Tensor<2>> {
        if self.cols() != other.cols() {
            return Err(ContrastError::shape_mismatch(
                "matmul_transposed",
                &format!("[_, {}]", self.cols()),
                &other.shape().to_string(),
            ));
        }

        let (n, m) = (self.rows(), other.rows());
        let mut out = vec![0.0f32; n * m];
        let fill = |(i, out_row): (usize, &mut [f32])| {
            let a = self.row(i);
            for (j, slot) in out_row.iter_mut().enumerate() {
                *slot = dot(a, other.row(j));
            }
        };
        if m > 0 {
            if n >= PARALLEL_ROWS {
                out.par_chunks_mut(m).enumerate().for_each(fill);
            } else {
                out.chunks_mut(m).enumerate().for_each(fill);
            }
        }

        Tensor::from_vec(out, Shape::new([n, m]))
    }

    /// `self @ other` for `self: [N, M]`, `other: [M, D]`, giving `[N, D]`
    pub fn matmul(&self, other: &Tensor<2>) -> ContrastResult<Tensor<2>> {
        if self.cols() != other.rows() {
            return Err(ContrastError::shape_mismatch(
                "matmul",
                &format!("[{}, _]", self.cols()),
                &other.shape().to_string(),
            ));
        }

        let (n, d) = (self.rows(), other.cols());
        let mut out = vec![0.0f32; n * d];
        if d > 0 {
            for (i, out_row) in out.chunks_mut(d).enumerate() {
                for (k, &a) in self.row(i).iter().enumerate() {
                    if a == 0.0 {
                        continue;
                    }
                    for (slot, &b) in out_row.iter_mut().zip(other.row(k)) {
                        *slot += a * b;
                    }
                }
            }
        }

        Tensor::from_vec(out, Shape::new([n, d]))
    }

    /// `self^T @ other` for `self: [N, A]`, `other: [N, B]`, giving `[A, B]`
    pub fn transpose_matmul(&self, other: &Tensor<2>) -> ContrastResult<Tensor<2>> {
        if self.rows() != other.rows() {
            return Err(ContrastError::shape_mismatch(
                "transpose_matmul",
                &format!("[{}, _]", self.rows()),
                &other.shape().to_string(),
            ));
        }

        let (a, b) = (self.cols(), other.cols());
        let mut out = vec![0.0f32; a * b];
        for n in 0..self.rows() {
            let lhs = self.row(n);
            let rhs = other.row(n);
            for (p, &x) in lhs.iter().enumerate() {
                if x == 0.0 {
                    continue;
                }
                let out_row = &mut out[p * b..(p + 1) * b];
                for (slot, &y) in out_row.iter_mut().zip(rhs) {
                    *slot += x * y;
                }
            }
        }

        Tensor::from_vec(out, Shape::new([a, b]))
    }

    /// Concatenate along the row dimension. All parts must share a width.
    pub fn concat_rows(parts: &[Tensor<2>]) -> ContrastResult<Tensor<2>> {
        let width = parts.first().map(|p| p.cols()).unwrap_or(0);
        let mut rows = 0;
        for part in parts {
            if part.cols() != width {
                return Err(ContrastError::shape_mismatch(
                    "concat_rows",
                    &format!("[_, {}]", width),
                    &part.shape().to_string(),
                ));
            }
            rows += part.rows();
        }

        let mut data = Vec::with_capacity(rows * width);
        for part in parts {
            data.extend_from_slice(part.as_slice());
        }
        Tensor::from_vec(data, Shape::new([rows, width]))
    }

    /// Select a contiguous block of rows
    pub fn slice_rows(&self, start: usize, len: usize) -> ContrastResult<Tensor<2>> {
        if start + len > self.rows() {
            return Err(ContrastError::InvalidInput(format!(
                "rows {}..{} out of range for {}",
                start,
                start + len,
                self.shape()
            )));
        }
        let cols = self.cols();
        Tensor::from_vec(
            self.data[start * cols..(start + len) * cols].to_vec(),
            Shape::new([len, cols]),
        )
    }

    /// Gather arbitrary rows by index
    pub fn select_rows(&self, indices: &[usize]) -> ContrastResult<Tensor<2>> {
        let cols = self.cols();
        let mut data = Vec::with_capacity(indices.len() * cols);
        for &i in indices {
            if i >= self.rows() {
                return Err(ContrastError::InvalidInput(format!(
                    "row {} out of range for {}",
                    i,
                    self.shape()
                )));
            }
            data.extend_from_slice(self.row(i));
        }
        Tensor::from_vec(data, Shape::new([indices.len(), cols]))
    }
}

impl<const DIMS: usize> Debug for Tensor<DIMS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("size", &self.shape.total_elements())
            .finish()
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_creation() {
        let shape = Shape::new([2, 3, 4]);
        assert_eq!(shape.total_elements(), 24);
        assert!(shape.is_valid());
        assert!(!Shape::new([2, 0]).is_valid());
        assert_eq!(Shape::new([4, 2]).to_string(), "[4, 2]");
    }

    #[test]
    fn test_from_vec_length_check() {
        assert!(Tensor::from_vec(vec![1.0; 5], Shape::new([2, 3])).is_err());
        let t = Tensor::from_vec(vec![1.0; 6], Shape::new([2, 3])).unwrap();
        assert_eq!(t.rows(), 2);
        assert_eq!(t.cols(), 3);
    }

    #[test]
    fn test_matmul_transposed() {
        let a = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], Shape::new([2, 2])).unwrap();
        let b = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new([3, 2])).unwrap();
        let c = a.matmul_transposed(&b).unwrap();
        assert_eq!(c.shape().dims, [2, 3]);
        assert_eq!(c.as_slice(), &[1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_matmul_and_transpose_matmul_agree() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new([2, 2])).unwrap();
        let b = Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], Shape::new([2, 2])).unwrap();
        // a @ b
        assert_eq!(a.matmul(&b).unwrap().as_slice(), &[19.0, 22.0, 43.0, 50.0]);
        // a^T @ b
        assert_eq!(a.transpose_matmul(&b).unwrap().as_slice(), &[26.0, 30.0, 38.0, 44.0]);
    }

    #[test]
    fn test_concat_and_slice_rows() {
        let a = Tensor::from_vec(vec![1.0, 2.0], Shape::new([1, 2])).unwrap();
        let b = Tensor::from_vec(vec![3.0, 4.0, 5.0, 6.0], Shape::new([2, 2])).unwrap();
        let c = Tensor::concat_rows(&[a, b.clone()]).unwrap();
        assert_eq!(c.shape().dims, [3, 2]);
        assert_eq!(c.slice_rows(1, 2).unwrap(), b);
        assert_eq!(c.select_rows(&[2, 0]).unwrap().as_slice(), &[5.0, 6.0, 1.0, 2.0]);

        let wide = Tensor::zeros(Shape::new([1, 3]));
        assert!(Tensor::concat_rows(&[c, wide]).is_err());
    }

    #[test]
    fn test_detach_drops_grad_flag() {
        let t = Tensor::zeros(Shape::new([2, 2])).with_grad(true);
        assert!(t.requires_grad());
        let d = t.detach();
        assert!(!d.requires_grad());
        assert_eq!(d.as_slice(), t.as_slice());
    }

    #[test]
    fn test_copy_on_write() {
        let a = Tensor::zeros(Shape::new([1, 2]));
        let mut b = a.clone();
        b.as_mut_slice()[0] = 1.0;
        assert_eq!(a.as_slice(), &[0.0, 0.0]);
        assert_eq!(b.as_slice(), &[1.0, 0.0]);
    }
}
