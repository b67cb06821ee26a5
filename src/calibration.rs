//! Calibration: per-stimulus spatial filters from multi-trial EEG.
//!
//! Every source-domain trial is notch filtered, split into sub-bands and cut
//! to the post-latency segment. Trials of one stimulus are averaged into a
//! template, and each source stimulus gets its `(Wx, Wy)` pair from a
//! multi-stimulus CCA over its neighbouring templates.

use std::collections::HashSet;
use std::ops::Range;

use ndarray::{concatenate, s, Array2, Array3, Array4, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cca::canoncorr;
use crate::config::TlccaConfig;
use crate::error::{Result, TlccaError};
use crate::filterbank::FilterBank;
use crate::reference::reference_signals;
use crate::stimulus::{DomainPartition, StimulusTable};

/// Raw calibration EEG, `[channels, time, stimulus, block]`.
///
/// The stimulus axis is in natural (display) order; blocks are addressed
/// by 1-based identifiers.
#[derive(Debug, Clone)]
pub struct CalibrationData {
    eeg: Array4<f64>,
}

impl CalibrationData {
    pub fn new(eeg: Array4<f64>, num_stimuli: usize) -> Result<Self> {
        let (channels, samples, stimuli, blocks) = eeg.dim();
        if stimuli != num_stimuli {
            return Err(TlccaError::InvalidInput(format!(
                "calibration tensor holds {stimuli} stimuli, expected {num_stimuli}"
            )));
        }
        if channels == 0 || samples == 0 || blocks == 0 {
            return Err(TlccaError::InvalidInput(format!(
                "empty calibration tensor {:?}",
                eeg.dim()
            )));
        }
        Ok(Self { eeg })
    }

    pub fn channels(&self) -> usize {
        self.eeg.dim().0
    }

    pub fn samples(&self) -> usize {
        self.eeg.dim().1
    }

    pub fn num_stimuli(&self) -> usize {
        self.eeg.dim().2
    }

    pub fn num_blocks(&self) -> usize {
        self.eeg.dim().3
    }

    /// `channels × time` trial of the natural-order stimulus in the 1-based block.
    pub fn trial(&self, natural: usize, block: usize) -> Result<ArrayView2<f64>> {
        if natural >= self.num_stimuli() || block == 0 || block > self.num_blocks() {
            return Err(TlccaError::InvalidInput(format!(
                "no trial for stimulus {natural} in block {block}"
            )));
        }
        Ok(self.eeg.slice(s![.., .., natural, block - 1]))
    }

    /// Checks 1-based block ids: non-empty, in range, no repeats.
    pub fn check_blocks(&self, blocks: &[usize]) -> Result<()> {
        if blocks.is_empty() {
            return Err(TlccaError::InvalidInput("no training blocks given".into()));
        }
        let mut seen = HashSet::new();
        for &block in blocks {
            if block == 0 || block > self.num_blocks() {
                return Err(TlccaError::InvalidInput(format!(
                    "block {block} outside 1..={}",
                    self.num_blocks()
                )));
            }
            if !seen.insert(block) {
                return Err(TlccaError::InvalidInput(format!("block {block} listed twice")));
            }
        }
        Ok(())
    }
}

/// Learned CCA weights of one sub-band, one column per source stimulus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialFilterSet {
    /// `channels × num_source`
    pub wx: Array2<f64>,
    /// `2·harmonics × num_source`
    pub wy: Array2<f64>,
}

/// Trial-averaged source responses per sub-band, `[channels, time, source]`.
pub type SourceTemplates = Vec<Array3<f64>>;

/// Neighbouring source stimuli stacked for the multi-stimulus CCA of `index`.
///
/// The window of `templates` stimuli is centred on `index` and slides inward
/// at either end of the source domain.
pub fn mscca_window(index: usize, num_source: usize, templates: usize) -> Range<usize> {
    if num_source == 0 {
        return 0..0;
    }
    let k = templates.clamp(1, num_source);
    let start = index.saturating_sub(k / 2).min(num_source - k);
    start..start + k
}

pub struct CalibrationTrainer<'a> {
    config: &'a TlccaConfig,
    stimuli: &'a StimulusTable,
    partition: &'a DomainPartition,
    filters: &'a FilterBank,
}

impl<'a> CalibrationTrainer<'a> {
    pub fn new(
        config: &'a TlccaConfig,
        stimuli: &'a StimulusTable,
        partition: &'a DomainPartition,
        filters: &'a FilterBank,
    ) -> Self {
        Self {
            config,
            stimuli,
            partition,
            filters,
        }
    }

    /// Notch, sub-band filter, cut and average the source trials of `blocks`.
    pub fn source_templates(
        &self,
        data: &CalibrationData,
        blocks: &[usize],
    ) -> Result<SourceTemplates> {
        data.check_blocks(blocks)?;
        if data.num_stimuli() != self.stimuli.len() {
            return Err(TlccaError::InvalidInput(format!(
                "calibration tensor holds {} stimuli, stimulus table has {}",
                data.num_stimuli(),
                self.stimuli.len()
            )));
        }
        let channels = data.channels();
        let length = self.config.calibration_samples();
        let start = self.config.latency_samples();
        let bands = self.filters.num_subbands();
        let scale = 1.0 / blocks.len() as f64;

        let mut templates =
            vec![Array3::<f64>::zeros((channels, length, self.partition.num_source())); bands];
        for (i, &pos) in self.partition.source_indices().iter().enumerate() {
            let natural = self.stimuli.canonical_to_natural(pos);
            for &block in blocks {
                let notched = self.filters.notch(data.trial(natural, block)?);
                for (band, template) in templates.iter_mut().enumerate() {
                    let filtered = self.filters.apply(band, notched.view());
                    let segment = cut_segment(filtered.view(), start, length);
                    template
                        .index_axis_mut(Axis(2), i)
                        .scaled_add(scale, &segment);
                }
            }
        }
        debug!(
            "Averaged {} source stimuli over {} blocks into {} sub-band templates",
            self.partition.num_source(),
            blocks.len(),
            bands
        );
        Ok(templates)
    }

    /// Multi-stimulus CCA for every source stimulus of every sub-band.
    ///
    /// A stimulus whose CCA cannot be solved keeps all-zero weight columns,
    /// which scoring treats as an untrained slot.
    pub fn spatial_filters(&self, templates: &SourceTemplates) -> Vec<SpatialFilterSet> {
        let references = self.source_references();
        templates
            .iter()
            .enumerate()
            .map(|(band, template)| {
                let set = self.fit_band(band, template, &references);
                info!(
                    "Sub-band {}/{}: fitted {} source spatial filters",
                    band + 1,
                    templates.len(),
                    self.partition.num_source()
                );
                set
            })
            .collect()
    }

    fn source_references(&self) -> Vec<Array2<f64>> {
        let length = self.config.calibration_samples();
        self.partition
            .source_indices()
            .iter()
            .map(|&pos| {
                reference_signals(
                    self.stimuli.frequency(pos),
                    self.stimuli.phase(pos),
                    length,
                    self.config.sampling_rate,
                    self.config.num_harmonics,
                )
            })
            .collect()
    }

    fn fit_band(
        &self,
        band: usize,
        template: &Array3<f64>,
        references: &[Array2<f64>],
    ) -> SpatialFilterSet {
        let (channels, _, num_source) = template.dim();
        let harmonics_rows = 2 * self.config.num_harmonics;
        let mut wx = Array2::zeros((channels, num_source));
        let mut wy = Array2::zeros((harmonics_rows, num_source));

        for i in 0..num_source {
            let window = mscca_window(i, num_source, self.config.num_signal_templates);
            let xs: Vec<_> = window
                .clone()
                .map(|m| template.index_axis(Axis(2), m).reversed_axes())
                .collect();
            let ys: Vec<_> = window.map(|m| references[m].t()).collect();
            let stacked = concatenate(Axis(0), &xs).and_then(|x| {
                concatenate(Axis(0), &ys).map(|y| (x, y))
            });
            let (x, y) = match stacked {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("Sub-band {}, source {}: cannot stack templates: {}", band + 1, i, err);
                    continue;
                }
            };

            match canoncorr(x.view(), y.view(), self.config.cca_regularization) {
                Ok(pair) => {
                    wx.column_mut(i).assign(&pair.x_weights);
                    wy.column_mut(i).assign(&pair.y_weights);
                }
                Err(err) => {
                    warn!("Sub-band {}, source {}: CCA failed ({}), slot left empty", band + 1, i, err);
                }
            }
        }
        SpatialFilterSet { wx, wy }
    }
}

/// `signal[:, start..start + length]`, zero-padded where the trial runs out.
fn cut_segment(signal: ArrayView2<f64>, start: usize, length: usize) -> Array2<f64> {
    let (channels, samples) = signal.dim();
    let mut out = Array2::zeros((channels, length));
    if start < samples {
        let available = (samples - start).min(length);
        out.slice_mut(s![.., ..available])
            .assign(&signal.slice(s![.., start..start + available]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filterbank::{NotchSpec, SubbandFilterSpec};
    use crate::reference::pearson;
    use ndarray::Array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn window_slides_inward_at_the_edges() {
        assert_eq!(mscca_window(0, 20, 5), 0..5);
        assert_eq!(mscca_window(1, 20, 5), 0..5);
        assert_eq!(mscca_window(2, 20, 5), 0..5);
        assert_eq!(mscca_window(3, 20, 5), 1..6);
        assert_eq!(mscca_window(10, 20, 5), 8..13);
        assert_eq!(mscca_window(17, 20, 5), 15..20);
        assert_eq!(mscca_window(19, 20, 5), 15..20);
        assert_eq!(mscca_window(1, 3, 5), 0..3);
        assert_eq!(mscca_window(0, 0, 5), 0..0);
    }

    #[test]
    fn cut_pads_short_trials_with_zeros() {
        let signal = Array::from_shape_fn((2, 10), |(c, t)| (c * 10 + t) as f64 + 1.0);
        let cut = cut_segment(signal.view(), 6, 6);
        assert_eq!(cut.row(0).to_vec(), vec![7.0, 8.0, 9.0, 10.0, 0.0, 0.0]);
        assert_eq!(cut_segment(signal.view(), 12, 3), Array2::<f64>::zeros((2, 3)));
    }

    #[test]
    fn block_ids_are_validated() {
        let data = CalibrationData::new(Array4::zeros((2, 20, 4, 3)), 4).unwrap();
        assert!(data.check_blocks(&[1, 3]).is_ok());
        assert!(data.check_blocks(&[]).is_err());
        assert!(data.check_blocks(&[0]).is_err());
        assert!(data.check_blocks(&[4]).is_err());
        assert!(data.check_blocks(&[2, 2]).is_err());
        assert!(CalibrationData::new(Array4::zeros((2, 20, 5, 3)), 4).is_err());
    }

    #[test]
    fn trial_access_checks_its_indices() {
        let data = CalibrationData::new(Array4::zeros((2, 20, 4, 3)), 4).unwrap();
        assert_eq!(data.trial(3, 3).unwrap().dim(), (2, 20));
        assert!(matches!(data.trial(0, 0), Err(TlccaError::InvalidInput(_))));
        assert!(matches!(data.trial(0, 4), Err(TlccaError::InvalidInput(_))));
        assert!(matches!(data.trial(4, 1), Err(TlccaError::InvalidInput(_))));
    }

    #[test]
    fn spatial_filter_recovers_mixing_direction() {
        let config = TlccaConfig::default();
        let stimuli = StimulusTable::benchmark();
        let partition = DomainPartition::alternating(stimuli.len()).unwrap();
        let filters = FilterBank::new(
            &SubbandFilterSpec::bank(1),
            &NotchSpec {
                line_frequency: config.line_frequency,
                quality: config.notch_quality,
            },
            config.sampling_rate,
        )
        .unwrap();

        // Channel 0 carries the reference fundamental, the others only noise.
        let (channels, samples, blocks) = (4, 533, 2);
        let mut rng = StdRng::seed_from_u64(5);
        let mut eeg = Array4::zeros((channels, samples, stimuli.len(), blocks));
        for natural in 0..stimuli.len() {
            let pos = stimuli.natural_to_canonical(natural);
            let reference = reference_signals(
                stimuli.frequency(pos),
                stimuli.phase(pos),
                samples,
                config.sampling_rate,
                1,
            );
            for block in 0..blocks {
                for t in 0..samples {
                    eeg[[0, t, natural, block]] = reference[[0, t]];
                    for c in 0..channels {
                        eeg[[c, t, natural, block]] += 0.1 * rng.gen_range(-1.0..1.0);
                    }
                }
            }
        }
        let data = CalibrationData::new(eeg, stimuli.len()).unwrap();
        let trainer = CalibrationTrainer::new(&config, &stimuli, &partition, &filters);
        let templates = trainer.source_templates(&data, &[1, 2]).unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].dim(), (channels, 500, 20));

        let sets = trainer.spatial_filters(&templates);
        let wx = &sets[0].wx;
        assert_eq!(wx.dim(), (channels, 20));
        assert_eq!(sets[0].wy.dim(), (10, 20));
        for i in 0..20 {
            let column = wx.column(i);
            assert!(column.iter().any(|w| *w != 0.0), "source {i} left empty");
            let projected = templates[0].index_axis(Axis(2), i).t().dot(&column);
            let channel0 = templates[0].slice(s![0, .., i]);
            assert!(pearson(projected.view(), channel0).abs() > 0.9);
        }
    }
}
