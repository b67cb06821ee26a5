//! Sub-band bandpass filters and the power-line notch cascade.
//!
//! Sub-band `k` passes `[8k, 90]` Hz. Each band is designed as a Chebyshev
//! type I filter (order chosen for 3 dB ripple / 40 dB attenuation against a
//! `[8k-2, 100]` Hz stopband) and realised as second-order sections. When the
//! order cannot be computed, a 6th-order Butterworth bandpass over the same
//! passband is used instead.
//!
//! All filtering is zero-phase (forward-backward) along the time axis with
//! odd-reflection padding and steady-state initial conditions.

use std::f64::consts::PI;

use butterworth::{Cutoff, Filter};
use ndarray::{Array2, ArrayView2, Axis};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TlccaError};

/// Signals shorter than this are returned unfiltered.
pub const MIN_FILTER_SAMPLES: usize = 10;

/// Design parameters of one sub-band. Frequencies are in Hz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubbandFilterSpec {
    /// 1-based sub-band number.
    pub band: usize,
    pub passband: [f64; 2],
    pub stopband: [f64; 2],
    /// Passband ripple used when selecting the order.
    pub order_ripple_db: f64,
    /// Passband ripple of the realised Chebyshev filter.
    pub design_ripple_db: f64,
    pub stopband_attenuation_db: f64,
    pub fallback_order: usize,
}

impl SubbandFilterSpec {
    pub fn for_band(band: usize) -> Self {
        let low = 8.0 * band as f64;
        Self {
            band,
            passband: [low, 90.0],
            stopband: [low - 2.0, 100.0],
            order_ripple_db: 3.0,
            design_ripple_db: 0.5,
            stopband_attenuation_db: 40.0,
            fallback_order: 6,
        }
    }

    /// One spec per sub-band, `1..=count`.
    pub fn bank(count: usize) -> Vec<Self> {
        (1..=count).map(Self::for_band).collect()
    }

    /// Designs the filter, preferring Chebyshev type I.
    pub fn design(&self, sampling_rate: f64) -> Result<SubbandFilter> {
        let nyquist = sampling_rate / 2.0;
        let wp = [self.passband[0] / nyquist, self.passband[1] / nyquist];
        let ws = [self.stopband[0] / nyquist, self.stopband[1] / nyquist];

        let chebyshev = cheb1ord(wp, ws, self.order_ripple_db, self.stopband_attenuation_db)
            .and_then(|(order, wn)| {
                cheby1_bandpass(order, self.design_ripple_db, wn).map(|sos| (order, sos))
            });
        if let Some((order, sos)) = chebyshev {
            debug!(
                "Sub-band {} designed as Chebyshev I, order {} ({} sections)",
                self.band,
                order,
                sos.sections.len()
            );
            return Ok(SubbandFilter::Chebyshev(sos));
        }

        warn!(
            "Sub-band {}: Chebyshev order could not be computed, falling back to Butterworth order {}",
            self.band, self.fallback_order
        );
        Filter::new(
            self.fallback_order,
            sampling_rate,
            Cutoff::BandPass(self.passband[0], self.passband[1]),
        )
        .map(SubbandFilter::Butterworth)
        .map_err(|_| TlccaError::FilterDesign {
            band: self.band,
            reason: format!(
                "passband {:?} Hz is not realisable at {} Hz",
                self.passband, sampling_rate
            ),
        })
    }
}

/// Power-line notch cascade parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotchSpec {
    pub line_frequency: f64,
    pub quality: f64,
}

impl NotchSpec {
    /// Notches at every multiple of the line frequency below Nyquist.
    pub fn design(&self, sampling_rate: f64) -> SosFilter {
        let nyquist = sampling_rate / 2.0;
        let mut sections = Vec::new();
        let mut k = 1;
        while (k as f64) * self.line_frequency < nyquist {
            let w0 = k as f64 * self.line_frequency / nyquist;
            sections.push(Biquad::notch(w0, self.quality));
            k += 1;
        }
        SosFilter { sections }
    }
}

/// One second-order section, `a[0] == 1`, transposed direct form II.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl Biquad {
    /// Second-order notch at normalised frequency `w0` (1 = Nyquist).
    fn notch(w0: f64, quality: f64) -> Self {
        let bw = w0 / quality * PI;
        let w0 = w0 * PI;
        let beta = (bw / 2.0).tan();
        let gain = 1.0 / (1.0 + beta);
        Self {
            b: [gain, -2.0 * gain * w0.cos(), gain],
            a: [1.0, -2.0 * gain * w0.cos(), 2.0 * gain - 1.0],
        }
    }

    /// State after a unit step has run through the section forever.
    fn step_state(&self) -> ([f64; 2], f64) {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let den = 1.0 + a1 + a2;
        let gain = if den.abs() > f64::EPSILON {
            (b0 + b1 + b2) / den
        } else {
            0.0
        };
        let z1 = b2 - a2 * gain;
        let z0 = b1 - a1 * gain + z1;
        ([z0, z1], gain)
    }
}

/// Cascade of second-order sections.
#[derive(Debug, Clone, PartialEq)]
pub struct SosFilter {
    pub sections: Vec<Biquad>,
}

impl SosFilter {
    fn order(&self) -> usize {
        2 * self.sections.len()
    }

    fn lfilter(&self, x: &[f64], initial: f64, zi: &[[f64; 2]]) -> Vec<f64> {
        let mut y = x.to_vec();
        for (section, z) in self.sections.iter().zip(zi) {
            let [b0, b1, b2] = section.b;
            let [_, a1, a2] = section.a;
            let mut z0 = z[0] * initial;
            let mut z1 = z[1] * initial;
            for v in y.iter_mut() {
                let input = *v;
                let out = b0 * input + z0;
                z0 = b1 * input - a1 * out + z1;
                z1 = b2 * input - a2 * out;
                *v = out;
            }
        }
        y
    }

    /// Per-section initial state for a unit step entering the cascade.
    fn steady_state(&self) -> Vec<[f64; 2]> {
        let mut scale = 1.0;
        self.sections
            .iter()
            .map(|section| {
                let (z, gain) = section.step_state();
                let zi = [z[0] * scale, z[1] * scale];
                scale *= gain;
                zi
            })
            .collect()
    }

    /// Zero-phase forward-backward filtering of one signal.
    pub fn filtfilt(&self, x: &[f64]) -> Vec<f64> {
        let n = x.len();
        if n < MIN_FILTER_SAMPLES || self.sections.is_empty() {
            return x.to_vec();
        }
        let padlen = (3 * (self.order() + 1)).min(n - 1);
        let extended = odd_extend(x, padlen);
        let zi = self.steady_state();

        let forward = self.lfilter(&extended, extended[0], &zi);
        let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
        let first = reversed[0];
        reversed = self.lfilter(&reversed, first, &zi);
        reversed.reverse();
        reversed[padlen..padlen + n].to_vec()
    }
}

fn odd_extend(x: &[f64], padlen: usize) -> Vec<f64> {
    let n = x.len();
    let (first, last) = (x[0], x[n - 1]);
    let mut out = Vec::with_capacity(n + 2 * padlen);
    out.extend((1..=padlen).rev().map(|i| 2.0 * first - x[i]));
    out.extend_from_slice(x);
    out.extend((1..=padlen).map(|i| 2.0 * last - x[n - 1 - i]));
    out
}

/// Minimum Chebyshev I order for a digital bandpass, with the natural passband edges.
///
/// Edges are normalised to Nyquist. Returns `None` when the edges are not
/// strictly inside `(0, 1)`, not nested, or the order is not finite.
fn cheb1ord(wp: [f64; 2], ws: [f64; 2], gpass: f64, gstop: f64) -> Option<(usize, [f64; 2])> {
    let inside = |w: f64| w > 0.0 && w < 1.0;
    if !wp.iter().chain(&ws).all(|&w| inside(w)) {
        return None;
    }
    if !(ws[0] < wp[0] && wp[0] < wp[1] && wp[1] < ws[1]) {
        return None;
    }

    let passb = wp.map(|w| (PI * w / 2.0).tan());
    let stopb = ws.map(|w| (PI * w / 2.0).tan());
    let nat = stopb
        .iter()
        .map(|s| ((s * s - passb[0] * passb[1]) / (s * (passb[0] - passb[1]))).abs())
        .fold(f64::INFINITY, f64::min);
    if !(nat > 1.0 && nat.is_finite()) {
        return None;
    }

    let gstop = 10f64.powf(0.1 * gstop.abs());
    let gpass = 10f64.powf(0.1 * gpass.abs());
    let order = (((gstop - 1.0) / (gpass - 1.0)).sqrt().acosh() / nat.acosh()).ceil();
    if !order.is_finite() || order < 1.0 {
        return None;
    }
    Some((order as usize, wp))
}

/// Digital Chebyshev I bandpass as second-order sections.
///
/// Returns `None` if the realised filter has a pole on or outside the unit circle.
fn cheby1_bandpass(order: usize, ripple_db: f64, wn: [f64; 2]) -> Option<SosFilter> {
    let n = order as f64;
    let eps = (10f64.powf(0.1 * ripple_db) - 1.0).sqrt();
    let mu = (1.0 / eps).asinh() / n;

    // Analog lowpass prototype.
    let prototype: Vec<Complex64> = (0..order)
        .map(|i| {
            let m = -(n - 1.0) + 2.0 * i as f64;
            let theta = PI * m / (2.0 * n);
            -Complex64::new(mu, theta).sinh()
        })
        .collect();
    let mut gain = prototype
        .iter()
        .fold(Complex64::new(1.0, 0.0), |acc, p| acc * (-p))
        .re;
    if order % 2 == 0 {
        gain /= (1.0 + eps * eps).sqrt();
    }

    // Pre-warp (fs = 2) and transform lowpass to bandpass.
    let fs2 = 4.0;
    let warped = wn.map(|w| fs2 * (PI * w / 2.0).tan());
    let bw = warped[1] - warped[0];
    let wo2 = warped[0] * warped[1];
    let mut analog = Vec::with_capacity(2 * order);
    for p in &prototype {
        let p_lp = p * (bw / 2.0);
        let root = (p_lp * p_lp - wo2).sqrt();
        analog.push(p_lp + root);
        analog.push(p_lp - root);
    }
    gain *= bw.powi(order as i32);

    // Bilinear transform. The `order` analog zeros at the origin map to z = 1,
    // the `order` zeros at infinity to z = -1.
    let poles: Vec<Complex64> = analog.iter().map(|p| (fs2 + p) / (fs2 - p)).collect();
    let denominator = analog
        .iter()
        .fold(Complex64::new(1.0, 0.0), |acc, p| acc * (fs2 - p));
    gain *= (Complex64::new(fs2.powi(order as i32), 0.0) / denominator).re;

    if !gain.is_finite() || poles.iter().any(|p| !(p.norm() < 1.0)) {
        return None;
    }

    let mut sections = pair_poles(&poles)?
        .into_iter()
        .map(|a| Biquad {
            b: [1.0, 0.0, -1.0],
            a,
        })
        .collect::<Vec<_>>();
    if sections.len() != order {
        return None;
    }
    for coeff in sections[0].b.iter_mut() {
        *coeff *= gain;
    }
    Some(SosFilter { sections })
}

/// Groups poles into real-coefficient denominators, poles far from the unit circle first.
fn pair_poles(poles: &[Complex64]) -> Option<Vec<[f64; 3]>> {
    let tolerance = 1e-10;
    let mut complex: Vec<Complex64> = poles.iter().copied().filter(|p| p.im > tolerance).collect();
    let mut real: Vec<f64> = poles
        .iter()
        .filter(|p| p.im.abs() <= tolerance)
        .map(|p| p.re)
        .collect();
    if real.len() % 2 != 0 {
        return None;
    }
    complex.sort_by(|a, b| a.norm().total_cmp(&b.norm()));
    real.sort_by(|a, b| a.abs().total_cmp(&b.abs()));

    let mut denominators: Vec<(f64, [f64; 3])> = complex
        .iter()
        .map(|p| (p.norm(), [1.0, -2.0 * p.re, p.norm_sqr()]))
        .collect();
    for pair in real.chunks(2) {
        let (p1, p2) = (pair[0], pair[1]);
        denominators.push((p1.abs().max(p2.abs()), [1.0, -(p1 + p2), p1 * p2]));
    }
    denominators.sort_by(|a, b| a.0.total_cmp(&b.0));
    Some(denominators.into_iter().map(|(_, a)| a).collect())
}

/// A designed sub-band filter.
pub enum SubbandFilter {
    Chebyshev(SosFilter),
    Butterworth(Filter),
}

impl SubbandFilter {
    pub fn is_chebyshev(&self) -> bool {
        matches!(self, SubbandFilter::Chebyshev(_))
    }

    fn filtfilt(&self, row: &[f64]) -> Vec<f64> {
        if row.len() < MIN_FILTER_SAMPLES {
            return row.to_vec();
        }
        match self {
            SubbandFilter::Chebyshev(sos) => sos.filtfilt(row),
            SubbandFilter::Butterworth(filter) => {
                let row_vec = row.to_vec();
                filter.bidirectional(&row_vec).unwrap_or(row_vec)
            }
        }
    }
}

/// The notch cascade plus one bandpass per sub-band, designed for one sampling rate.
pub struct FilterBank {
    notch: SosFilter,
    subbands: Vec<SubbandFilter>,
}

impl FilterBank {
    pub fn new(specs: &[SubbandFilterSpec], notch: &NotchSpec, sampling_rate: f64) -> Result<Self> {
        let subbands = specs
            .iter()
            .map(|spec| spec.design(sampling_rate))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            notch: notch.design(sampling_rate),
            subbands,
        })
    }

    pub fn num_subbands(&self) -> usize {
        self.subbands.len()
    }

    pub fn subband(&self, band: usize) -> &SubbandFilter {
        &self.subbands[band]
    }

    /// Removes line noise from every channel (rows are channels).
    pub fn notch(&self, signal: ArrayView2<f64>) -> Array2<f64> {
        filter_rows(signal, |row| self.notch.filtfilt(row))
    }

    /// Applies the bandpass of the 0-based sub-band `band` to every channel.
    pub fn apply(&self, band: usize, signal: ArrayView2<f64>) -> Array2<f64> {
        let filter = &self.subbands[band];
        filter_rows(signal, |row| filter.filtfilt(row))
    }
}

fn filter_rows<F>(signal: ArrayView2<f64>, filter: F) -> Array2<f64>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let mut out = signal.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let row_vec = row.to_vec();
        let transformed = filter(&row_vec);
        for (dst, src) in row.iter_mut().zip(transformed) {
            *dst = src;
        }
    }
    out
}
