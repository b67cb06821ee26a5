//! First canonical component between two multichannel signals.
//!
//! The primary path whitens the cross-covariance with Cholesky factors and
//! takes its leading singular pair, as MATLAB's `canoncorr` does. If either
//! covariance is not positive definite after regularisation, the same pair
//! is found by alternating least-squares regressions instead.

use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{concatenate, Array1, ArrayView2, Axis};
use ndarray_stats::CorrelationExt;
use thiserror::Error;
use tracing::debug;

const ALS_MAX_ITERATIONS: usize = 500;
const ALS_TOLERANCE: f64 = 1e-12;
const PINV_EPS: f64 = 1e-14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcaMethod {
    CholeskySvd,
    AlternatingLeastSquares,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcaFailure {
    #[error("need at least two observations")]
    TooFewSamples,
    #[error("inputs have different numbers of observations")]
    ShapeMismatch,
    #[error("no canonical pair could be extracted")]
    Degenerate,
}

/// Weight vectors of the first canonical component.
///
/// Both projections `X·a` and `Y·b` have unit sample variance.
#[derive(Debug, Clone)]
pub struct CanonicalPair {
    pub x_weights: Array1<f64>,
    pub y_weights: Array1<f64>,
    pub correlation: f64,
    pub method: CcaMethod,
}

/// Regularised sample covariance blocks of `[X, Y]` (unbiased, `n - 1`).
pub struct CovarianceBlocks {
    xx: DMatrix<f64>,
    yy: DMatrix<f64>,
    xy: DMatrix<f64>,
}

impl CovarianceBlocks {
    /// `x` is `n × p`, `y` is `n × q`; rows are observations.
    pub fn new(
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        regularization: f64,
    ) -> Result<Self, CcaFailure> {
        let n = x.nrows();
        if n != y.nrows() {
            return Err(CcaFailure::ShapeMismatch);
        }
        if n < 2 || x.ncols() == 0 || y.ncols() == 0 {
            return Err(CcaFailure::TooFewSamples);
        }
        let p = x.ncols();
        let q = y.ncols();

        let joined = concatenate(Axis(1), &[x.view(), y.view()])
            .map_err(|_| CcaFailure::ShapeMismatch)?;
        let cov = joined.t().cov(1.).map_err(|_| CcaFailure::TooFewSamples)?;

        let xx = DMatrix::from_fn(p, p, |i, j| {
            cov[[i, j]] + if i == j { regularization } else { 0.0 }
        });
        let yy = DMatrix::from_fn(q, q, |i, j| {
            cov[[p + i, p + j]] + if i == j { regularization } else { 0.0 }
        });
        let xy = DMatrix::from_fn(p, q, |i, j| cov[[i, p + j]]);
        Ok(Self { xx, yy, xy })
    }
}

/// Canonical correlation of `x` (`n × p`) and `y` (`n × q`), primary path first.
pub fn canoncorr(
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    regularization: f64,
) -> Result<CanonicalPair, CcaFailure> {
    let blocks = CovarianceBlocks::new(x, y, regularization)?;
    if let Some(pair) = cholesky_svd(&blocks) {
        return Ok(pair);
    }
    debug!("Cholesky factorisation failed, using alternating least squares CCA");
    alternating_least_squares(&blocks).ok_or(CcaFailure::Degenerate)
}

/// Whitened cross-covariance SVD. `None` if a covariance is not positive definite.
pub fn cholesky_svd(blocks: &CovarianceBlocks) -> Option<CanonicalPair> {
    let lx = Cholesky::new(blocks.xx.clone())?.l();
    let ly = Cholesky::new(blocks.yy.clone())?.l();

    // Lx^-1 · Cxy · Ly^-T
    let left = lx.solve_lower_triangular(&blocks.xy)?;
    let whitened = ly.solve_lower_triangular(&left.transpose())?.transpose();

    let svd = whitened.svd(true, true);
    let lead = svd
        .singular_values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)?;
    let u = svd.u.as_ref()?.column(lead).into_owned();
    let v = svd.v_t.as_ref()?.row(lead).transpose();

    let a = lx.tr_solve_lower_triangular(&u)?;
    let b = ly.tr_solve_lower_triangular(&v)?;
    finish(a, b, svd.singular_values[lead], CcaMethod::CholeskySvd)
}

/// Alternating regressions `a ∝ Cxx⁺·Cxy·b`, `b ∝ Cyy⁺·Cyx·a` until `b` stops moving.
pub fn alternating_least_squares(blocks: &CovarianceBlocks) -> Option<CanonicalPair> {
    let xx_inv = blocks.xx.clone().pseudo_inverse(PINV_EPS).ok()?;
    let yy_inv = blocks.yy.clone().pseudo_inverse(PINV_EPS).ok()?;
    let yx = blocks.xy.transpose();

    let q = blocks.yy.nrows();
    let start = (0..q).max_by(|&i, &j| blocks.yy[(i, i)].total_cmp(&blocks.yy[(j, j)]))?;
    let mut b = unit_variance(DVector::from_fn(q, |i, _| f64::from(i == start)), &blocks.yy)?;
    let mut a = unit_variance(&xx_inv * (&blocks.xy * &b), &blocks.xx)?;

    for _ in 0..ALS_MAX_ITERATIONS {
        let b_next = unit_variance(&yy_inv * (&yx * &a), &blocks.yy)?;
        let a_next = unit_variance(&xx_inv * (&blocks.xy * &b_next), &blocks.xx)?;
        let delta = (&b_next - &b).norm();
        a = a_next;
        b = b_next;
        if delta < ALS_TOLERANCE {
            break;
        }
    }

    let correlation = a.dot(&(&blocks.xy * &b));
    finish(a, b, correlation, CcaMethod::AlternatingLeastSquares)
}

fn unit_variance(v: DVector<f64>, cov: &DMatrix<f64>) -> Option<DVector<f64>> {
    let var = v.dot(&(cov * &v));
    if var > 0.0 && var.is_finite() {
        Some(v / var.sqrt())
    } else {
        None
    }
}

fn finish(
    a: DVector<f64>,
    b: DVector<f64>,
    correlation: f64,
    method: CcaMethod,
) -> Option<CanonicalPair> {
    if !correlation.is_finite() || a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return None;
    }
    Some(CanonicalPair {
        x_weights: Array1::from_iter(a.iter().copied()),
        y_weights: Array1::from_iter(b.iter().copied()),
        correlation,
        method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::pearson;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    /// X and Y share one latent signal on top of independent noise.
    fn coupled(n: usize) -> (Array2<f64>, Array2<f64>) {
        let latent = noise(n, 1, 7);
        let mut x = noise(n, 3, 11) * 0.5;
        let mut y = noise(n, 4, 13) * 0.5;
        for i in 0..n {
            x[[i, 0]] += latent[[i, 0]];
            x[[i, 2]] -= 0.5 * latent[[i, 0]];
            y[[i, 1]] += 2.0 * latent[[i, 0]];
            y[[i, 3]] += latent[[i, 0]];
        }
        (x, y)
    }

    fn projected_corr(x: &Array2<f64>, y: &Array2<f64>, pair: &CanonicalPair) -> f64 {
        let u = x.dot(&pair.x_weights);
        let v = y.dot(&pair.y_weights);
        pearson(u.view(), v.view())
    }

    #[test]
    fn identical_inputs_correlate_perfectly() {
        let x = noise(200, 3, 1);
        let pair = canoncorr(x.view(), x.view(), 1e-12).unwrap();
        assert_eq!(pair.method, CcaMethod::CholeskySvd);
        assert_abs_diff_eq!(projected_corr(&x, &x, &pair), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pair.correlation, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn projections_have_unit_variance() {
        let (x, y) = coupled(300);
        let pair = canoncorr(x.view(), y.view(), 1e-12).unwrap();
        let u = x.dot(&pair.x_weights);
        assert_abs_diff_eq!(u.var(1.0), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            projected_corr(&x, &y, &pair).abs(),
            pair.correlation,
            epsilon = 1e-9
        );
    }

    #[test]
    fn fallback_agrees_with_primary_on_well_conditioned_input() {
        let (x, y) = coupled(300);
        let blocks = CovarianceBlocks::new(x.view(), y.view(), 1e-12).unwrap();
        let primary = cholesky_svd(&blocks).unwrap();
        let fallback = alternating_least_squares(&blocks).unwrap();
        assert_eq!(fallback.method, CcaMethod::AlternatingLeastSquares);

        assert_abs_diff_eq!(primary.correlation, fallback.correlation, epsilon = 1e-8);
        let same_direction = pearson(
            x.dot(&primary.x_weights).view(),
            x.dot(&fallback.x_weights).view(),
        );
        assert_abs_diff_eq!(same_direction.abs(), 1.0, epsilon = 1e-8);
    }

    #[test]
    fn rank_deficient_covariance_takes_the_fallback() {
        // Two identical columns of variance 2^20: the 1e-12 ridge vanishes in
        // rounding, so Cxx stays singular and Cholesky fails.
        let k = 1024.0;
        let x = ndarray::arr2(&[[k, k], [-k, -k], [0.0, 0.0]]);
        let y = ndarray::arr2(&[[1.0], [-1.0], [0.0]]);
        let blocks = CovarianceBlocks::new(x.view(), y.view(), 1e-12).unwrap();
        assert!(cholesky_svd(&blocks).is_none());

        let pair = canoncorr(x.view(), y.view(), 1e-12).unwrap();
        assert_eq!(pair.method, CcaMethod::AlternatingLeastSquares);
        assert_abs_diff_eq!(pair.correlation, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(projected_corr(&x, &y, &pair), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn single_column_signal_against_references() {
        let (x, y) = coupled(250);
        let column = x.column(0).insert_axis(Axis(1));
        let pair = canoncorr(column, y.view(), 1e-12).unwrap();
        assert_eq!(pair.x_weights.len(), 1);
        assert!(pair.correlation > 0.5);
    }

    #[test]
    fn too_few_rows_is_reported() {
        let x = noise(1, 2, 3);
        let y = noise(1, 2, 4);
        assert_eq!(
            canoncorr(x.view(), y.view(), 1e-12).unwrap_err(),
            CcaFailure::TooFewSamples
        );
        let y = noise(5, 2, 4);
        assert_eq!(
            canoncorr(x.view(), y.view(), 1e-12).unwrap_err(),
            CcaFailure::ShapeMismatch
        );
    }
}
