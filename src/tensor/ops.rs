//! Row-wise numerical kernels shared by the losses and the model

use super::core::{dot, Shape, Tensor};
use crate::error::ContrastResult;

/// Lower bound on the squared norm before dividing, matching `l2_normalize`
pub const NORM_EPSILON: f32 = 1e-12;

/// L2-normalize every row. Returns the normalized rows and the norms used.
pub fn l2_normalize_rows(x: &Tensor<2>) -> (Tensor<2>, Vec<f32>) {
    let cols = x.cols();
    let mut data = Vec::with_capacity(x.numel());
    let mut norms = Vec::with_capacity(x.rows());
    for row in x.row_iter() {
        let norm = dot(row, row).max(NORM_EPSILON).sqrt();
        norms.push(norm);
        data.extend(row.iter().map(|v| v / norm));
    }
    let out = Tensor::from_vec(data, Shape::new([x.rows(), cols]))
        .unwrap_or_else(|_| Tensor::zeros(Shape::new([x.rows(), cols])))
        .with_grad(x.requires_grad());
    (out, norms)
}

/// Backward pass of [`l2_normalize_rows`].
///
/// For `y = x / |x|`: `dx = (dy - y (y . dy)) / |x|`.
pub fn l2_normalize_backward(
    normalized: &Tensor<2>,
    norms: &[f32],
    grad_output: &Tensor<2>,
) -> ContrastResult<Tensor<2>> {
    let cols = normalized.cols();
    let mut data = Vec::with_capacity(normalized.numel());
    for (i, (y, dy)) in normalized.row_iter().zip(grad_output.row_iter()).enumerate() {
        let proj = dot(y, dy);
        let norm = norms[i];
        data.extend(y.iter().zip(dy).map(|(&yv, &dyv)| (dyv - yv * proj) / norm));
    }
    Tensor::from_vec(data, Shape::new([normalized.rows(), cols]))
}

/// Numerically stable `log(sum(exp(values)))`. Empty input gives `-inf`.
pub fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f32 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// `log_sum_exp` restricted to the entries where `keep` is true
pub fn masked_log_sum_exp(values: &[f32], keep: impl Fn(usize) -> bool) -> f32 {
    let max = values
        .iter()
        .enumerate()
        .filter(|(j, _)| keep(*j))
        .map(|(_, &v)| v)
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f32 = values
        .iter()
        .enumerate()
        .filter(|(j, _)| keep(*j))
        .map(|(_, v)| (v - max).exp())
        .sum();
    max + sum.ln()
}

/// `log(exp(a) + exp(b))` without overflow; either side may be `-inf`
pub fn log_add_exp(a: f32, b: f32) -> f32 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if hi == f32::NEG_INFINITY {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Softmax of one row, written into `out`. Returns the row's log-sum-exp.
pub fn softmax_into(values: &[f32], out: &mut [f32]) -> f32 {
    let lse = log_sum_exp(values);
    for (o, v) in out.iter_mut().zip(values) {
        *o = (v - lse).exp();
    }
    lse
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize_rows() {
        let x = Tensor::from_vec(vec![3.0, 4.0, 0.0, 2.0], Shape::new([2, 2])).unwrap();
        let (y, norms) = l2_normalize_rows(&x);
        assert_eq!(norms, vec![5.0, 2.0]);
        assert!((y.as_slice()[0] - 0.6).abs() < 1e-6);
        assert!((y.as_slice()[1] - 0.8).abs() < 1e-6);
        assert_eq!(&y.as_slice()[2..], &[0.0, 1.0]);
    }

    #[test]
    fn test_l2_normalize_zero_row_is_finite() {
        let x = Tensor::zeros(Shape::new([1, 3]));
        let (y, _) = l2_normalize_rows(&x);
        assert!(y.all_finite());
    }

    #[test]
    fn test_l2_normalize_backward_matches_finite_difference() {
        let x = Tensor::from_vec(vec![0.3, -1.2, 0.7], Shape::new([1, 3])).unwrap();
        let upstream = Tensor::from_vec(vec![0.5, 0.1, -0.4], Shape::new([1, 3])).unwrap();
        let (y, norms) = l2_normalize_rows(&x);
        let grad = l2_normalize_backward(&y, &norms, &upstream).unwrap();

        let objective = |t: &Tensor<2>| -> f32 {
            let (n, _) = l2_normalize_rows(t);
            dot(n.as_slice(), upstream.as_slice())
        };
        let h = 1e-3;
        for k in 0..3 {
            let mut plus = x.clone();
            plus.as_mut_slice()[k] += h;
            let mut minus = x.clone();
            minus.as_mut_slice()[k] -= h;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h);
            assert!((numeric - grad.as_slice()[k]).abs() < 1e-2, "component {}", k);
        }
    }

    #[test]
    fn test_log_sum_exp_is_stable() {
        let lse = log_sum_exp(&[1000.0, 1000.0]);
        assert!((lse - (1000.0 + 2.0f32.ln())).abs() < 1e-3);
        assert_eq!(log_sum_exp(&[]), f32::NEG_INFINITY);
    }

    #[test]
    fn test_masked_log_sum_exp() {
        let values = [1.0, 50.0, 2.0];
        let lse = masked_log_sum_exp(&values, |j| j != 1);
        let expected = (1.0f32.exp() + 2.0f32.exp()).ln();
        assert!((lse - expected).abs() < 1e-5);
        assert_eq!(masked_log_sum_exp(&values, |_| false), f32::NEG_INFINITY);
    }

    #[test]
    fn test_log_add_exp() {
        let v = log_add_exp(0.0, 0.0);
        assert!((v - 2.0f32.ln()).abs() < 1e-6);
        assert_eq!(log_add_exp(f32::NEG_INFINITY, -3.0), -3.0);
        assert_eq!(log_add_exp(f32::NEG_INFINITY, f32::NEG_INFINITY), f32::NEG_INFINITY);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut out = [0.0; 3];
        let lse = softmax_into(&[10.0, 0.0, -10.0], &mut out);
        assert!((lse - log_sum_exp(&[10.0, 0.0, -10.0])).abs() < 1e-6);
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(out[0] > out[1] && out[1] > out[2]);
    }
}
