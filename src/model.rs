use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::calibration::SpatialFilterSet;
use crate::error::{Result, TlccaError};
use crate::filterbank::{FilterBank, NotchSpec, SubbandFilterSpec};
use crate::stimulus::{DomainPartition, StimulusTable};
use crate::transfer::TransferFilterSet;

/// Everything online scoring needs for one subject and calibration split.
///
/// Filters are stored as design parameters and redesigned on load; weight
/// matrices are kept as-is, including all-zero columns of untrained slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    sampling_rate: f64,
    num_harmonics: usize,
    num_subbands: usize,
    /// Samples per synthetic transfer template.
    template_length: usize,
    cca_regularization: f64,
    /// 1-based calibration blocks the model was fitted on.
    training_blocks: Vec<usize>,
    stimuli: StimulusTable,
    partition: DomainPartition,
    subband_filters: Vec<SubbandFilterSpec>,
    notch: NotchSpec,
    spatial: Vec<SpatialFilterSet>,
    transfer: Vec<TransferFilterSet>,
}

/// Trained components handed to [`Model::new`].
pub struct ModelParts {
    pub sampling_rate: f64,
    pub num_harmonics: usize,
    pub template_length: usize,
    pub cca_regularization: f64,
    pub training_blocks: Vec<usize>,
    pub stimuli: StimulusTable,
    pub partition: DomainPartition,
    pub subband_filters: Vec<SubbandFilterSpec>,
    pub notch: NotchSpec,
    pub spatial: Vec<SpatialFilterSet>,
    pub transfer: Vec<TransferFilterSet>,
}

impl Model {
    pub fn new(parts: ModelParts) -> Result<Self> {
        let model = Self {
            sampling_rate: parts.sampling_rate,
            num_harmonics: parts.num_harmonics,
            num_subbands: parts.subband_filters.len(),
            template_length: parts.template_length,
            cca_regularization: parts.cca_regularization,
            training_blocks: parts.training_blocks,
            stimuli: parts.stimuli,
            partition: parts.partition,
            subband_filters: parts.subband_filters,
            notch: parts.notch,
            spatial: parts.spatial,
            transfer: parts.transfer,
        };
        model.validate()?;
        Ok(model)
    }

    /// Checks that every table is present and all shapes agree.
    pub fn validate(&self) -> Result<()> {
        let malformed = |msg: String| Err(TlccaError::MalformedModel(msg));

        if !(self.sampling_rate > 0.0 && self.sampling_rate.is_finite()) {
            return malformed(format!("sampling rate {}", self.sampling_rate));
        }
        if self.num_harmonics == 0 {
            return malformed("no harmonics".into());
        }
        if self.num_subbands == 0 {
            return malformed("no sub-bands".into());
        }
        if self.stimuli.len() != self.partition.len() {
            return malformed(format!(
                "{} stimuli but domain partition covers {}",
                self.stimuli.len(),
                self.partition.len()
            ));
        }
        for (name, len) in [
            ("sub-band filter", self.subband_filters.len()),
            ("spatial filter", self.spatial.len()),
            ("transfer filter", self.transfer.len()),
        ] {
            if len != self.num_subbands {
                return malformed(format!(
                    "{len} {name} sets for {} sub-bands",
                    self.num_subbands
                ));
            }
        }

        let channels = self.spatial[0].wx.nrows();
        if channels == 0 {
            return malformed("spatial filters have no channels".into());
        }
        let (num_source, num_target) = (self.partition.num_source(), self.partition.num_target());
        for band in 0..self.num_subbands {
            let expected = [
                ("Wx_source", self.spatial[band].wx.dim(), (channels, num_source)),
                (
                    "Wy_source",
                    self.spatial[band].wy.dim(),
                    (2 * self.num_harmonics, num_source),
                ),
                ("Wx_transfer", self.transfer[band].wx.dim(), (channels, num_target)),
                (
                    "templates_transfer",
                    self.transfer[band].templates.dim(),
                    (self.template_length, num_target),
                ),
            ];
            for (name, actual, wanted) in expected {
                if actual != wanted {
                    return malformed(format!(
                        "sub-band {}: {name} is {actual:?}, expected {wanted:?}",
                        band + 1
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn num_harmonics(&self) -> usize {
        self.num_harmonics
    }

    pub fn num_subbands(&self) -> usize {
        self.num_subbands
    }

    pub fn template_length(&self) -> usize {
        self.template_length
    }

    pub fn cca_regularization(&self) -> f64 {
        self.cca_regularization
    }

    pub fn channels(&self) -> usize {
        self.spatial[0].wx.nrows()
    }

    pub fn training_blocks(&self) -> &[usize] {
        &self.training_blocks
    }

    pub fn stimuli(&self) -> &StimulusTable {
        &self.stimuli
    }

    pub fn partition(&self) -> &DomainPartition {
        &self.partition
    }

    pub fn subband_filters(&self) -> &[SubbandFilterSpec] {
        &self.subband_filters
    }

    pub fn notch(&self) -> &NotchSpec {
        &self.notch
    }

    pub fn spatial(&self, band: usize) -> &SpatialFilterSet {
        &self.spatial[band]
    }

    pub fn transfer(&self, band: usize) -> &TransferFilterSet {
        &self.transfer[band]
    }

    /// Redesigns the notch and sub-band filters for the stored sampling rate.
    pub fn filter_bank(&self) -> Result<FilterBank> {
        FilterBank::new(&self.subband_filters, &self.notch, self.sampling_rate)
    }

    pub fn from_json(json_str: &str) -> Result<Self> {
        let model: Model = serde_json::from_str(json_str)?;
        model.validate()?;
        Ok(model)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// True if a weight column carries no information.
pub(crate) fn is_empty_slot(matrix: &Array2<f64>, column: usize) -> bool {
    matrix.column(column).iter().all(|v| *v == 0.0)
}
