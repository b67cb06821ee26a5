//! SSVEP symbol recognition with transfer-learning CCA.
//!
//! A model is calibrated on half of the stimulus frequencies, the other half
//! is synthesised by transferring the learned responses to neighbouring
//! frequencies, and short EEG windows are then scored against all symbols.

pub mod calibration;
pub mod cca;
pub mod config;
pub mod error;
pub mod filterbank;
pub mod io;
pub mod model;
pub mod reference;
pub mod scoring;
pub mod stimulus;
pub mod streaming;
pub mod transfer;

use tracing::info;

pub use calibration::{CalibrationData, CalibrationTrainer, SpatialFilterSet};
pub use config::{SessionConfig, TensorLayout, TlccaConfig};
pub use error::{Result, TlccaError};
pub use model::Model;
pub use scoring::{OnlineScorer, Ranking};
pub use stimulus::{DomainPartition, StimulusTable, BENCHMARK_SYMBOLS};
pub use streaming::{EegWindow, StreamingWindower, WindowPoll};
pub use transfer::{AlsReport, TransferFilterSet, TransferLearner};

use filterbank::{FilterBank, NotchSpec, SubbandFilterSpec};
use model::ModelParts;

/// ALS diagnostics of a training run, `[sub-band][target stimulus]`.
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub als: Vec<Vec<AlsReport>>,
}

impl TrainingReport {
    pub fn converged(&self) -> usize {
        self.als.iter().flatten().filter(|r| r.converged).count()
    }

    pub fn total(&self) -> usize {
        self.als.iter().map(Vec::len).sum()
    }

    /// Mean target quality of one sub-band (0-based).
    ///
    /// Quality is measured against the fundamental, so only the lowest
    /// sub-band, whose passband keeps it, is expected to score high.
    pub fn band_target_quality(&self, band: usize) -> f64 {
        match self.als.get(band) {
            Some(reports) if !reports.is_empty() => {
                reports.iter().map(|r| r.target_quality).sum::<f64>() / reports.len() as f64
            }
            _ => 0.0,
        }
    }
}

/// Trains a model for the 40-target keyboard on the given 1-based blocks.
pub fn train(data: &CalibrationData, training_blocks: &[usize], config: &TlccaConfig) -> Result<Model> {
    train_with_report(data, training_blocks, config).map(|(model, _)| model)
}

pub fn train_with_report(
    data: &CalibrationData,
    training_blocks: &[usize],
    config: &TlccaConfig,
) -> Result<(Model, TrainingReport)> {
    let stimuli = StimulusTable::benchmark();
    let partition = DomainPartition::alternating(stimuli.len())?;
    let subband_filters = SubbandFilterSpec::bank(config.num_subbands);
    let notch = NotchSpec {
        line_frequency: config.line_frequency,
        quality: config.notch_quality,
    };
    let filters = FilterBank::new(&subband_filters, &notch, config.sampling_rate)?;

    info!(
        "Training on blocks {:?}: {} channels, {} sub-bands, {} source / {} target stimuli",
        training_blocks,
        data.channels(),
        subband_filters.len(),
        partition.num_source(),
        partition.num_target()
    );
    let calibration = CalibrationTrainer::new(config, &stimuli, &partition, &filters);
    let templates = calibration.source_templates(data, training_blocks)?;
    let spatial = calibration.spatial_filters(&templates);

    let (transfer, als) = TransferLearner::new(config, &stimuli, &partition).learn(&templates);
    let report = TrainingReport { als };
    info!(
        "ALS converged for {}/{} target stimuli, sub-band 1 target quality {:.3}",
        report.converged(),
        report.total(),
        report.band_target_quality(0)
    );

    let model = Model::new(ModelParts {
        sampling_rate: config.sampling_rate,
        num_harmonics: config.num_harmonics,
        template_length: config.transfer_samples(),
        cca_regularization: config.cca_regularization,
        training_blocks: training_blocks.to_vec(),
        stimuli,
        partition,
        subband_filters,
        notch,
        spatial,
        transfer,
    })?;
    Ok((model, report))
}

/// Ranks all symbols for one window.
pub fn score(window: &EegWindow, model: &Model) -> Result<Ranking> {
    OnlineScorer::new(model)?.rank_window(window)
}
