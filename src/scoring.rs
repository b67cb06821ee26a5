//! Online scoring of an EEG window against every candidate stimulus.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::cca::canoncorr;
use crate::config::TlccaConfig;
use crate::error::{Result, TlccaError};
use crate::filterbank::FilterBank;
use crate::model::{is_empty_slot, Model};
use crate::reference::{pearson, reference_signals_at};
use crate::stimulus::Domain;
use crate::streaming::EegWindow;

/// Template correlations need more overlap than this many samples.
const MIN_TEMPLATE_OVERLAP: usize = 10;

/// Per-symbol scores with their descending order.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    /// Indexed by natural (display) symbol index.
    scores: Vec<f64>,
    order: Vec<usize>,
}

impl Ranking {
    pub fn from_scores(scores: Vec<f64>) -> Self {
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        Self { scores, order }
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    /// Natural symbol indices, best first.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn best(&self) -> Option<usize> {
        self.order.first().copied()
    }

    /// `(symbol_index, score)` pairs, best first.
    pub fn ranked(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.order.iter().map(|&i| (i, self.scores[i]))
    }
}

/// Scores windows against a loaded model.
///
/// The filter bank is designed once at construction; each call is a pure
/// function of the window.
pub struct OnlineScorer<'m> {
    model: &'m Model,
    filters: FilterBank,
}

impl<'m> OnlineScorer<'m> {
    pub fn new(model: &'m Model) -> Result<Self> {
        let filters = model.filter_bank()?;
        Ok(Self { model, filters })
    }

    pub fn model(&self) -> &Model {
        self.model
    }

    /// Accumulated score of every stimulus, in natural order, for a window
    /// starting at the stimulus-locked origin.
    pub fn score_all(&self, window: ArrayView2<f64>) -> Result<Vec<f64>> {
        self.score_all_at(window, 0)
    }

    /// Like [`score_all`](Self::score_all) for a window starting `offset`
    /// samples after the stimulus-locked origin.
    ///
    /// `window` is `channels × samples`. Candidates are scored in parallel.
    pub fn score_all_at(&self, window: ArrayView2<f64>, offset: usize) -> Result<Vec<f64>> {
        let model = self.model;
        if window.nrows() != model.channels() {
            return Err(TlccaError::InvalidInput(format!(
                "window has {} channels, model expects {}",
                window.nrows(),
                model.channels()
            )));
        }

        let notched = self.filters.notch(window);
        let bands: Vec<Array2<f64>> = (0..model.num_subbands())
            .map(|band| self.filters.apply(band, notched.view()))
            .collect();

        Ok((0..model.stimuli().len())
            .into_par_iter()
            .map(|natural| stimulus_score(model, &bands, natural, offset))
            .collect())
    }

    pub fn rank(&self, window: ArrayView2<f64>) -> Result<Ranking> {
        self.score_all(window).map(Ranking::from_scores)
    }

    /// Ranks a streamed window after checking it was sampled at the model's rate.
    pub fn rank_window(&self, window: &EegWindow) -> Result<Ranking> {
        if (window.sampling_rate - self.model.sampling_rate()).abs() > 1e-9 {
            return Err(TlccaError::InvalidInput(format!(
                "window sampled at {} Hz, model trained at {} Hz",
                window.sampling_rate,
                self.model.sampling_rate()
            )));
        }
        self.score_all_at(window.data.view(), window.stimulus_offset)
            .map(Ranking::from_scores)
    }
}

fn stimulus_score(model: &Model, bands: &[Array2<f64>], natural: usize, offset: usize) -> f64 {
    let stimuli = model.stimuli();
    let pos = stimuli.natural_to_canonical(natural);
    let samples = bands.first().map_or(0, |b| b.ncols());
    let reference = reference_signals_at(
        stimuli.frequency(pos),
        stimuli.phase(pos),
        offset,
        samples,
        model.sampling_rate(),
        model.num_harmonics(),
    );
    let domain = model.partition().domain(pos);

    bands
        .iter()
        .enumerate()
        .map(|(band, x)| {
            let components = match domain {
                Domain::Source(i) => source_components(model, band, i, x.view(), reference.view()),
                Domain::Target(i) => {
                    target_components(model, band, i, offset, x.view(), reference.view())
                }
            };
            TlccaConfig::subband_weight(band + 1) * signed_square_sum(components)
        })
        .sum()
}

/// `(r1a, r3)` of a calibrated stimulus. The template match only counts its strength.
fn source_components(
    model: &Model,
    band: usize,
    i: usize,
    x: ArrayView2<f64>,
    reference: ArrayView2<f64>,
) -> [f64; 3] {
    let set = model.spatial(band);
    if is_empty_slot(&set.wx, i) {
        return [0.0; 3];
    }
    let projected = set.wx.column(i).dot(&x);
    let r1a = if is_empty_slot(&set.wy, i) {
        0.0
    } else {
        let reference_projected = set.wy.column(i).dot(&reference);
        pearson(projected.view(), reference_projected.view()).abs()
    };
    let r3 = second_stage(projected.view(), reference, model.cca_regularization());
    [r1a, 0.0, r3]
}

/// `(r1b, r3)` of a transferred stimulus, reading the template from `offset` on.
fn target_components(
    model: &Model,
    band: usize,
    i: usize,
    offset: usize,
    x: ArrayView2<f64>,
    reference: ArrayView2<f64>,
) -> [f64; 3] {
    let set = model.transfer(band);
    if is_empty_slot(&set.wx, i) {
        return [0.0; 3];
    }
    let projected = set.wx.column(i).dot(&x);
    let column = set.templates.column(i);
    let template = column.slice(s![offset.min(column.len())..]);
    let overlap = template.len().min(projected.len());
    let r1b = if overlap > MIN_TEMPLATE_OVERLAP && !is_empty_slot(&set.templates, i) {
        pearson(
            projected.slice(s![..overlap]),
            template.slice(s![..overlap]),
        )
        .abs()
    } else {
        0.0
    };
    let r3 = second_stage(projected.view(), reference, model.cca_regularization());
    [0.0, r1b, r3]
}

/// CCA between the spatially filtered signal and the references, or, if
/// that fails, its plain correlation with the fundamental cosine.
fn second_stage(projected: ArrayView1<f64>, reference: ArrayView2<f64>, regularization: f64) -> f64 {
    let column = projected.insert_axis(Axis(1));
    match canoncorr(column, reference.t(), regularization) {
        Ok(pair) => {
            let u: Array1<f64> = column.dot(&pair.x_weights);
            let v: Array1<f64> = reference.t().dot(&pair.y_weights);
            pearson(u.view(), v.view())
        }
        Err(_) => pearson(projected, reference.row(0)),
    }
}

/// `Σ sign(r)·r²`
fn signed_square_sum(components: [f64; 3]) -> f64 {
    components.iter().map(|r| r.signum() * r * r).sum()
}
