use std::f64::consts::PI;

use ndarray::{Array2, ArrayView1};

/// Multi-harmonic sinusoidal model of the steady-state response.
///
/// Row `2(h-1)` is `cos(2π·h·f·t + h·φ)` and row `2(h-1)+1` the matching
/// sine, for `h = 1..=harmonics` and `t = n / sampling_rate`.
pub fn reference_signals(
    frequency: f64,
    phase: f64,
    num_samples: usize,
    sampling_rate: f64,
    harmonics: usize,
) -> Array2<f64> {
    reference_signals_at(frequency, phase, 0, num_samples, sampling_rate, harmonics)
}

/// [`reference_signals`] starting `offset` samples after the response onset.
pub fn reference_signals_at(
    frequency: f64,
    phase: f64,
    offset: usize,
    num_samples: usize,
    sampling_rate: f64,
    harmonics: usize,
) -> Array2<f64> {
    Array2::from_shape_fn((2 * harmonics, num_samples), |(row, n)| {
        let h = (row / 2 + 1) as f64;
        let t = (offset + n) as f64 / sampling_rate;
        let arg = 2.0 * PI * h * frequency * t + h * phase;
        if row % 2 == 0 {
            arg.cos()
        } else {
            arg.sin()
        }
    })
}

/// Pearson correlation of two equally long signals.
///
/// Degenerate input (length mismatch, fewer than two samples, a constant
/// signal, non-finite values) yields 0 rather than NaN.
pub fn pearson(x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    let n = x.len();
    if n != y.len() || n < 2 {
        return 0.0;
    }
    let mx = x.sum() / n as f64;
    let my = y.sum() / n as f64;

    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (&a, &b) in x.iter().zip(y.iter()) {
        let (da, db) = (a - mx, b - my);
        sxy += da * db;
        sxx += da * da;
        syy += db * db;
    }
    if sxx == 0.0 || syy == 0.0 {
        return 0.0;
    }
    let r = sxy / (sxx * syy).sqrt();
    if r.is_finite() {
        r.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
