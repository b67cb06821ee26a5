//! Cross-frequency transfer of source responses to target stimuli.
//!
//! A source template `S` (`channels × time`) is modelled as `w·S ≈ x̂·H`,
//! where `H` stacks shifted copies of the stimulus impulse train. Once the
//! spatial filter `w` and impulse response `x̂` are separated by alternating
//! least squares, `x̂` is re-rendered through the target stimulus' impulse
//! train to obtain a synthetic target template.

use std::f64::consts::PI;

use nalgebra::DMatrix;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibration::SourceTemplates;
use crate::config::TlccaConfig;
use crate::reference::pearson;
use crate::stimulus::{DomainPartition, StimulusTable};

const PINV_EPS: f64 = 1e-12;
/// Fraction of each stimulus cycle the square wave spends "on".
const DUTY_CYCLE: f64 = 0.2;
/// Minimum spacing between impulses, as a fraction of the stimulus period.
const REFRACTORY_FRACTION: f64 = 0.9;

/// Transfer weights of one sub-band, one column per target stimulus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferFilterSet {
    /// `channels × num_target`
    pub wx: Array2<f64>,
    /// `template_samples × num_target`
    pub templates: Array2<f64>,
}

/// Diagnostics of one ALS decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlsReport {
    pub iterations: usize,
    /// Change of the reconstruction error over the last iteration.
    pub final_delta: f64,
    pub converged: bool,
    /// `|corr(w·S, x̂·H)|` on the source stimulus.
    pub reconstruction_correlation: f64,
    /// Best absolute correlation of the target template with the ideal target sinusoid.
    pub target_quality: f64,
}

/// Impulse train driven by a flickering stimulus.
///
/// The luminance `cos(2πft + φ) + 1` is sample-and-held at each monitor
/// refresh. Only the first sample of every "on" phase of a 20 % duty square
/// wave keeps the held luminance; a refractory count of `0.9·fs/f` samples
/// prevents a second impulse within the same cycle.
pub fn stimulus_impulses(
    frequency: f64,
    phase: f64,
    num_samples: usize,
    sampling_rate: f64,
    refresh_rate: f64,
) -> Array1<f64> {
    let luminance: Vec<f64> = (0..num_samples)
        .map(|n| (2.0 * PI * frequency * n as f64 / sampling_rate + phase).cos() + 1.0)
        .collect();

    let step = sampling_rate / refresh_rate;
    let refreshes = (refresh_rate * num_samples as f64 / sampling_rate).ceil() as usize;
    let instants: Vec<usize> = (0..refreshes)
        .map(|k| (step * k as f64).round_ties_even() as usize)
        .collect();

    let mut held = vec![0.0; num_samples];
    let mut value = luminance.first().copied().unwrap_or(0.0);
    let mut next = 0;
    for (n, slot) in held.iter_mut().enumerate() {
        if next < instants.len() && n == instants[next] {
            value = luminance[n];
            if next + 1 < instants.len() {
                next += 1;
            }
        }
        *slot = value;
    }

    let threshold = (REFRACTORY_FRACTION * sampling_rate / frequency).floor() as usize;
    let mut count = threshold + 1;
    let on_width = 2.0 * PI * DUTY_CYCLE;
    Array1::from_shape_fn(num_samples, |n| {
        let angle = (2.0 * PI * frequency * n as f64 / sampling_rate + phase).rem_euclid(2.0 * PI);
        if angle >= on_width {
            count = threshold + 1;
            0.0
        } else if count >= threshold {
            count = 1;
            held[n]
        } else {
            count += 1;
            0.0
        }
    })
}

/// `erp_len × n` matrix whose row `k` is the impulse train delayed by `k` samples.
pub fn convolution_matrix(impulses: ArrayView1<f64>, erp_len: usize) -> Array2<f64> {
    let n = impulses.len();
    let mut h = Array2::zeros((erp_len, n));
    for k in 0..erp_len.min(n) {
        h.slice_mut(s![k, k..]).assign(&impulses.slice(s![..n - k]));
    }
    h
}

/// Impulse response length for a source stimulus: `round(factor / f · fs)`.
pub fn erp_length(source_frequency: f64, sampling_rate: f64, period_factor: f64) -> usize {
    (period_factor / source_frequency * sampling_rate).round_ties_even() as usize
}

/// Patches exact-zero samples with a damped copy of the segment starting at `offset`.
///
/// All zero positions, in order, take the values of `signal[offset..offset + count]`
/// scaled by `gain`. Nothing changes if that segment would run past the end.
pub fn repair_zero_runs(signal: &mut Array1<f64>, offset: usize, gain: f64) {
    let zeros: Vec<usize> = signal
        .iter()
        .enumerate()
        .filter(|(_, v)| **v == 0.0)
        .map(|(i, _)| i)
        .collect();
    if zeros.is_empty() || offset + zeros.len() > signal.len() {
        return;
    }
    let patch = signal.slice(s![offset..offset + zeros.len()]).to_owned();
    for (&i, &v) in zeros.iter().zip(patch.iter()) {
        signal[i] = gain * v;
    }
}

/// Result of transferring one source stimulus to its paired target.
#[derive(Debug, Clone)]
pub struct TransferredStimulus {
    pub spatial_filter: Array1<f64>,
    /// Synthetic target response over the full source template length.
    pub template: Array1<f64>,
    pub report: AlsReport,
}

struct AlsFit {
    w: Array1<f64>,
    x_hat: Array1<f64>,
    iterations: usize,
    final_delta: f64,
}

pub struct TransferLearner<'a> {
    config: &'a TlccaConfig,
    stimuli: &'a StimulusTable,
    partition: &'a DomainPartition,
}

impl<'a> TransferLearner<'a> {
    pub fn new(
        config: &'a TlccaConfig,
        stimuli: &'a StimulusTable,
        partition: &'a DomainPartition,
    ) -> Self {
        Self {
            config,
            stimuli,
            partition,
        }
    }

    /// Runs the transfer for every target stimulus of every sub-band.
    pub fn learn(&self, templates: &SourceTemplates) -> (Vec<TransferFilterSet>, Vec<Vec<AlsReport>>) {
        let keep = self.config.transfer_samples();
        let pairs = self.partition.num_target().min(self.partition.num_source());
        let mut sets = Vec::with_capacity(templates.len());
        let mut reports = Vec::with_capacity(templates.len());

        for (band, template) in templates.iter().enumerate() {
            let channels = template.dim().0;
            let mut wx = Array2::zeros((channels, self.partition.num_target()));
            let mut kept = Array2::zeros((keep, self.partition.num_target()));
            let mut band_reports = Vec::with_capacity(pairs);

            for i in 0..pairs {
                let source = template.index_axis(Axis(2), i);
                let Some(result) = self.transfer(source, i) else {
                    warn!("Sub-band {}, target {}: ALS could not start, slot left empty", band + 1, i);
                    band_reports.push(AlsReport {
                        iterations: 0,
                        final_delta: f64::NAN,
                        converged: false,
                        reconstruction_correlation: 0.0,
                        target_quality: 0.0,
                    });
                    continue;
                };
                debug!(
                    "Sub-band {}, target {}: {} iterations, delta {:.2e}, reconstruction {:.4}, target quality {:.4}",
                    band + 1,
                    i,
                    result.report.iterations,
                    result.report.final_delta,
                    result.report.reconstruction_correlation,
                    result.report.target_quality
                );
                if !result.report.converged {
                    warn!(
                        "Sub-band {}, target {}: ALS stopped after {} iterations without converging",
                        band + 1,
                        i,
                        result.report.iterations
                    );
                }
                wx.column_mut(i).assign(&result.spatial_filter);
                let len = keep.min(result.template.len());
                kept.slice_mut(s![..len, i])
                    .assign(&result.template.slice(s![..len]));
                band_reports.push(result.report);
            }

            info!("Sub-band {}/{}: transferred {} target stimuli", band + 1, templates.len(), pairs);
            sets.push(TransferFilterSet { wx, templates: kept });
            reports.push(band_reports);
        }
        (sets, reports)
    }

    /// Transfers source `index` to target `index` from a `channels × time` source template.
    ///
    /// Returns `None` only if neither `H·Hᵀ` nor `S·Sᵀ` can be inverted or
    /// pseudo-inverted.
    pub fn transfer(&self, source: ArrayView2<f64>, index: usize) -> Option<TransferredStimulus> {
        let cfg = self.config;
        let fs = cfg.sampling_rate;
        let source_pos = self.partition.source_indices()[index];
        let target_pos = self.partition.target_indices()[index];
        let (f_src, ph_src) = (self.stimuli.frequency(source_pos), self.stimuli.phase(source_pos));
        let (f_tgt, ph_tgt) = (self.stimuli.frequency(target_pos), self.stimuli.phase(target_pos));
        let length = source.ncols();

        let erp_len = erp_length(f_src, fs, cfg.erp_period_factor);
        let h_source = convolution_matrix(
            stimulus_impulses(f_src, ph_src, length, fs, cfg.refresh_rate).view(),
            erp_len,
        );
        let fit = self.decompose(source, h_source.view(), cfg.als_seed + index as u64)?;

        let repair_offset = fs.round() as usize;
        let mut reconstructed = fit.x_hat.dot(&h_source);
        repair_zero_runs(&mut reconstructed, repair_offset, cfg.repair_gain);
        let projected = fit.w.dot(&source);
        let reconstruction_correlation = pearson(projected.view(), reconstructed.view()).abs();

        let h_target = convolution_matrix(
            stimulus_impulses(f_tgt, ph_tgt, length, fs, cfg.refresh_rate).view(),
            erp_len,
        );
        let mut template = fit.x_hat.dot(&h_target);
        repair_zero_runs(&mut template, repair_offset, cfg.repair_gain);

        if template.iter().chain(fit.w.iter()).any(|v| !v.is_finite()) {
            warn!("Transfer to target {} produced non-finite values", index);
            return None;
        }

        let target_quality = ideal_match(template.view(), f_tgt, ph_tgt, fs);
        Some(TransferredStimulus {
            spatial_filter: fit.w,
            template,
            report: AlsReport {
                iterations: fit.iterations,
                final_delta: fit.final_delta,
                converged: fit.final_delta <= cfg.als_tolerance,
                reconstruction_correlation,
                target_quality,
            },
        })
    }

    /// Alternating least squares for `w·S ≈ x̂·H`, both factors rescaled to unit std each step.
    fn decompose(&self, s: ArrayView2<f64>, h: ArrayView2<f64>, seed: u64) -> Option<AlsFit> {
        let cfg = self.config;
        let hht_inv = invert(&h.dot(&h.t()))?;
        let sst_inv = invert(&s.dot(&s.t()))?;
        // x̂ = w·S·Hᵀ·(H·Hᵀ)⁻¹ and w = x̂·H·Sᵀ·(S·Sᵀ)⁻¹
        let to_impulse = s.dot(&h.t()).dot(&hht_inv);
        let to_spatial = h.dot(&s.t()).dot(&sst_inv);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut w: Array1<f64> = (0..s.nrows())
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        let mut x_hat = w.dot(&to_impulse);
        let residual = |w: &Array1<f64>, x: &Array1<f64>| {
            let diff = w.dot(&s) - x.dot(&h);
            diff.dot(&diff).sqrt()
        };
        let mut error = residual(&w, &x_hat);

        let mut iterations = 1;
        let mut delta = f64::INFINITY;
        while delta > cfg.als_tolerance && iterations < cfg.als_max_iterations {
            let w_new = x_hat.dot(&to_spatial);
            let x_new = w_new.dot(&to_impulse);
            let e_new = residual(&w_new, &x_new);
            iterations += 1;
            delta = (error - e_new).abs();

            let (w_std, x_std) = (w_new.std(0.0), x_new.std(0.0));
            if !(w_std > 0.0 && x_std > 0.0 && w_std.is_finite() && x_std.is_finite()) {
                break;
            }
            w = w_new / w_std;
            x_hat = x_new / x_std;
            error = e_new;
        }

        Some(AlsFit {
            w,
            x_hat,
            iterations,
            final_delta: delta,
        })
    }
}

/// `max(|corr(y, sin)|, |corr(y, cos)|)` against the ideal response at `frequency`.
fn ideal_match(signal: ArrayView1<f64>, frequency: f64, phase: f64, sampling_rate: f64) -> f64 {
    let angle =
        Array1::from_shape_fn(signal.len(), |n| 2.0 * PI * frequency * n as f64 / sampling_rate + phase);
    let sin = angle.mapv(f64::sin);
    let cos = angle.mapv(f64::cos);
    pearson(signal, sin.view()).abs().max(pearson(signal, cos.view()).abs())
}

/// Inverse, or the pseudo-inverse when the matrix is singular.
fn invert(m: &Array2<f64>) -> Option<Array2<f64>> {
    let (rows, cols) = m.dim();
    let matrix = DMatrix::from_fn(rows, cols, |i, j| m[[i, j]]);
    let inverse = match matrix.clone().try_inverse() {
        Some(inverse) => inverse,
        None => matrix.pseudo_inverse(PINV_EPS).ok()?,
    };
    Some(Array2::from_shape_fn((cols, rows), |(i, j)| inverse[(i, j)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array3};
    use rand::Rng;

    #[test]
    fn one_impulse_per_stimulus_cycle() {
        let fs = 250.0;
        let train = stimulus_impulses(10.0, 0.0, 500, fs, 60.0);
        let onsets: Vec<usize> = train
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(onsets.len(), 20);
        assert_eq!(onsets[0], 0);
        // 25-sample period; rounding of the phase angle can push an onset by one sample.
        assert!(onsets.windows(2).all(|w| (24..=26).contains(&(w[1] - w[0]))));
        // Held luminance is cos + 1, so never above 2.
        assert!(train.iter().all(|v| (0.0..=2.0).contains(v)));
    }

    #[test]
    fn phase_delays_the_first_impulse() {
        let train = stimulus_impulses(10.0, PI, 100, 250.0, 60.0);
        let first = train.iter().position(|v| *v != 0.0).unwrap();
        // cos(2π·10·t + π) reaches phase 2π at t = 50 ms.
        assert_eq!(first, 13);
    }

    #[test]
    fn convolution_rows_are_shifted_copies() {
        let h = convolution_matrix(arr1(&[1.0, 2.0, 3.0, 4.0]).view(), 3);
        assert_eq!(h.row(0).to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(h.row(1).to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(h.row(2).to_vec(), vec![0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn erp_length_spans_slightly_more_than_a_period() {
        assert_eq!(erp_length(8.2, 250.0, 1.05), 32);
        assert_eq!(erp_length(15.8, 250.0, 1.05), 17);
    }

    #[test]
    fn zero_samples_take_the_damped_later_segment() {
        let mut y = arr1(&[0.0, 0.0, 1.0, 2.0, 5.0, 10.0]);
        repair_zero_runs(&mut y, 4, 0.8);
        assert_eq!(y.to_vec(), vec![4.0, 8.0, 1.0, 2.0, 5.0, 10.0]);

        let mut short = arr1(&[0.0, 0.0, 1.0]);
        repair_zero_runs(&mut short, 2, 0.8);
        assert_eq!(short.to_vec(), vec![0.0, 0.0, 1.0]);
    }

    fn periodic_source(
        stimuli: &StimulusTable,
        partition: &DomainPartition,
        index: usize,
        seed: u64,
    ) -> Array2<f64> {
        let pos = partition.source_indices()[index];
        let (f, ph) = (stimuli.frequency(pos), stimuli.phase(pos));
        let mixing = [1.0, -0.6, 0.3, 0.0];
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((mixing.len(), 500), |(c, n)| {
            mixing[c] * (2.0 * PI * f * n as f64 / 250.0 + ph).cos() + 0.02 * rng.gen_range(-1.0..1.0)
        })
    }

    #[test]
    fn periodic_source_transfers_to_target_sinusoid() {
        let config = TlccaConfig::default();
        let stimuli = StimulusTable::benchmark();
        let partition = DomainPartition::alternating(stimuli.len()).unwrap();
        let learner = TransferLearner::new(&config, &stimuli, &partition);

        for index in [0, 4, 9, 19] {
            let source = periodic_source(&stimuli, &partition, index, 100 + index as u64);
            let result = learner.transfer(source.view(), index).unwrap();
            assert_eq!(result.spatial_filter.len(), 4);
            assert_eq!(result.template.len(), 500);
            assert!(result.report.converged, "{:?}", result.report);
            assert!(result.report.reconstruction_correlation > 0.9, "{:?}", result.report);
            assert!(result.report.target_quality > 0.8, "{:?}", result.report);
        }
    }

    #[test]
    fn same_seed_gives_identical_transfer() {
        let config = TlccaConfig::default();
        let stimuli = StimulusTable::benchmark();
        let partition = DomainPartition::alternating(stimuli.len()).unwrap();
        let learner = TransferLearner::new(&config, &stimuli, &partition);
        let source = periodic_source(&stimuli, &partition, 3, 9);
        let a = learner.transfer(source.view(), 3).unwrap();
        let b = learner.transfer(source.view(), 3).unwrap();
        assert_eq!(a.template, b.template);
        assert_eq!(a.spatial_filter, b.spatial_filter);
    }

    #[test]
    fn learn_fills_every_band_and_target() {
        let config = TlccaConfig::default();
        let stimuli = StimulusTable::benchmark();
        let partition = DomainPartition::alternating(stimuli.len()).unwrap();
        let learner = TransferLearner::new(&config, &stimuli, &partition);

        let mut template = Array3::zeros((4, 500, 20));
        for i in 0..20 {
            template
                .index_axis_mut(Axis(2), i)
                .assign(&periodic_source(&stimuli, &partition, i, i as u64));
        }
        let (sets, reports) = learner.learn(&vec![template]);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].wx.dim(), (4, 20));
        assert_eq!(sets[0].templates.dim(), (250, 20));
        assert_eq!(reports[0].len(), 20);
        for i in 0..20 {
            assert!(sets[0].templates.column(i).iter().any(|v| *v != 0.0));
        }
        assert!(reports[0].iter().all(|r| r.converged));
    }

    #[test]
    fn iteration_cap_keeps_the_unconverged_estimate() {
        let config = TlccaConfig {
            als_max_iterations: 3,
            als_tolerance: 0.0,
            ..TlccaConfig::default()
        };
        let stimuli = StimulusTable::benchmark();
        let partition = DomainPartition::alternating(stimuli.len()).unwrap();
        let learner = TransferLearner::new(&config, &stimuli, &partition);

        let mut template = Array3::zeros((4, 500, 20));
        for i in 0..20 {
            template
                .index_axis_mut(Axis(2), i)
                .assign(&periodic_source(&stimuli, &partition, i, 50 + i as u64));
        }
        let (sets, reports) = learner.learn(&vec![template]);
        for (i, report) in reports[0].iter().enumerate() {
            assert!(!report.converged, "{:?}", report);
            assert_eq!(report.iterations, 3);
            assert!(report.final_delta > 0.0);
            assert!(sets[0].wx.column(i).iter().any(|v| *v != 0.0));
            assert!(sets[0].templates.column(i).iter().any(|v| *v != 0.0));
        }
    }
}
