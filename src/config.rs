use std::ops::Range;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Every constant the training and scoring pipelines depend on.
///
/// The defaults reproduce the 40-target benchmark setup: 250 Hz EEG, five
/// sub-bands, five harmonics and a 2 s calibration segment starting 130 ms
/// after stimulus onset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlccaConfig {
    /// Sampling rate of every EEG tensor and window, in Hz.
    pub sampling_rate: f64,
    pub num_subbands: usize,
    pub num_harmonics: usize,
    /// Neighbouring source stimuli stacked into one multi-stimulus CCA.
    pub num_signal_templates: usize,
    /// Visual pathway latency skipped at the start of each calibration trial, in seconds.
    pub latency_delay: f64,
    /// Length of the calibration segment cut from each trial, in seconds.
    pub calibration_length: f64,
    /// Length of the synthetic transfer templates kept in the model, in seconds.
    pub transfer_window: f64,
    pub line_frequency: f64,
    pub notch_quality: f64,
    /// Monitor refresh rate used to sample-and-hold the stimulus luminance.
    pub refresh_rate: f64,
    /// Impulse response length as a multiple of the source stimulus period.
    pub erp_period_factor: f64,
    pub als_tolerance: f64,
    pub als_max_iterations: usize,
    /// Stimulus `i` seeds its ALS initialisation with `als_seed + i`.
    pub als_seed: u64,
    /// Damping applied when patching exact-zero runs of a reconstructed signal.
    pub repair_gain: f64,
    pub cca_regularization: f64,
}

impl Default for TlccaConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 250.0,
            num_subbands: 5,
            num_harmonics: 5,
            num_signal_templates: 5,
            latency_delay: 0.13,
            calibration_length: 2.0,
            transfer_window: 1.0,
            line_frequency: 50.0,
            notch_quality: 35.0,
            refresh_rate: 60.0,
            erp_period_factor: 1.05,
            als_tolerance: 1e-4,
            als_max_iterations: 200,
            als_seed: 42,
            repair_gain: 0.8,
            cca_regularization: 1e-12,
        }
    }
}

impl TlccaConfig {
    pub fn latency_samples(&self) -> usize {
        (self.latency_delay * self.sampling_rate).round() as usize
    }

    pub fn calibration_samples(&self) -> usize {
        (self.calibration_length * self.sampling_rate).round() as usize
    }

    pub fn transfer_samples(&self) -> usize {
        (self.transfer_window * self.sampling_rate).round() as usize
    }

    /// Filter-bank weight `k^(-1.25) + 0.25` for the 1-based sub-band `k`.
    pub fn subband_weight(band: usize) -> f64 {
        (band as f64).powf(-1.25) + 0.25
    }
}

/// Shape of the `[channels, time, stimulus, block]` EEG tensor stored per subject.
///
/// The time axis holds complete trials, cue included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorLayout {
    pub channels: usize,
    pub samples: usize,
    pub stimuli: usize,
    pub blocks: usize,
}

impl Default for TensorLayout {
    fn default() -> Self {
        Self {
            channels: 9,
            samples: 750,
            stimuli: 40,
            blocks: 4,
        }
    }
}

/// Runtime settings for the replay binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub subject: u32,
    pub data_dir: PathBuf,
    pub model_dir: PathBuf,
    pub layout: TensorLayout,
    /// 1-based block labels kept out of calibration and replayed online.
    pub held_out_blocks: Vec<usize>,
    /// Recognition window length, in seconds.
    pub window: f64,
    /// Poll interval of the replay loop, in milliseconds.
    pub update_interval_ms: u64,
    /// Cue shown before flicker onset, in seconds.
    pub cue_duration: f64,
    pub flicker_duration: f64,
    /// Total length of one replayed trial (cue, flicker, rest), in seconds.
    pub trial_duration: f64,
    pub algorithm: TlccaConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            subject: 1,
            data_dir: PathBuf::from("data"),
            model_dir: PathBuf::from("tlcca_models"),
            layout: TensorLayout::default(),
            held_out_blocks: vec![4],
            window: 0.8,
            update_interval_ms: 20,
            cue_duration: 0.5,
            flicker_duration: 2.0,
            trial_duration: 3.0,
            algorithm: TlccaConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Samples of a stored trial used for calibration: flicker onset
    /// through latency plus flicker.
    pub fn calibration_range(&self) -> Range<usize> {
        let fs = self.algorithm.sampling_rate;
        let start = (self.cue_duration * fs).floor() as usize;
        let len = self.algorithm.latency_samples() + (self.flicker_duration * fs).round() as usize;
        start..start + len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subband_weights_decrease() {
        let weights: Vec<f64> = (1..=5).map(TlccaConfig::subband_weight).collect();
        approx::assert_abs_diff_eq!(weights[0], 1.25, epsilon = 1e-12);
        assert!(weights.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn derived_sample_counts() {
        let cfg = TlccaConfig::default();
        assert_eq!(cfg.calibration_samples(), 500);
        assert_eq!(cfg.transfer_samples(), 250);
        assert_eq!(cfg.latency_samples(), 33);
    }

    #[test]
    fn partial_session_json_keeps_defaults() {
        let cfg = SessionConfig::from_json(r#"{"subject": 7, "window": 1.0}"#).unwrap();
        assert_eq!(cfg.subject, 7);
        assert_eq!(cfg.window, 1.0);
        assert_eq!(cfg.algorithm, TlccaConfig::default());
        assert_eq!(cfg.held_out_blocks, vec![4]);
    }

    #[test]
    fn calibration_cut_skips_the_cue() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.calibration_range(), 125..658);
        assert!(cfg.calibration_range().end <= cfg.layout.samples);
    }
}
