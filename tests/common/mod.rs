#![allow(dead_code)]

use std::sync::OnceLock;

use ndarray::{s, Array2, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use tlcca_speller::reference::reference_signals;
use tlcca_speller::{
    train_with_report, CalibrationData, EegWindow, Model, StimulusTable, TlccaConfig,
    TrainingReport,
};

pub const CHANNELS: usize = 8;
pub const BLOCKS: usize = 4;
/// Latency plus the 2 s calibration segment at 250 Hz.
pub const SAMPLES: usize = 533;
pub const LATENCY: usize = 33;
pub const NOISE: f64 = 0.2;

/// A subject whose channels mix the harmonic references of the attended
/// stimulus, delayed by the visual latency, plus white noise.
pub fn synthetic_subject(seed: u64) -> CalibrationData {
    let config = TlccaConfig::default();
    let stimuli = StimulusTable::benchmark();
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mixing = Array2::from_shape_fn((CHANNELS, 2 * config.num_harmonics), |_| {
        normal.sample(&mut rng)
    });
    let amplitudes = Array2::from_shape_fn((2 * config.num_harmonics, 1), |(row, _)| {
        1.0 / (row / 2 + 1) as f64
    });

    let mut eeg = Array4::zeros((CHANNELS, SAMPLES, stimuli.len(), BLOCKS));
    for natural in 0..stimuli.len() {
        let response = stimulus_response(&stimuli, natural, &mixing, &amplitudes, &config);
        for block in 0..BLOCKS {
            let mut trial = eeg.slice_mut(s![.., .., natural, block]);
            trial.assign(&response);
            trial.mapv_inplace(|v| v + NOISE * normal.sample(&mut rng));
        }
    }
    CalibrationData::new(eeg, stimuli.len()).unwrap()
}

fn stimulus_response(
    stimuli: &StimulusTable,
    natural: usize,
    mixing: &Array2<f64>,
    amplitudes: &Array2<f64>,
    config: &TlccaConfig,
) -> Array2<f64> {
    let pos = stimuli.natural_to_canonical(natural);
    let reference = reference_signals(
        stimuli.frequency(pos),
        stimuli.phase(pos),
        SAMPLES - LATENCY,
        config.sampling_rate,
        config.num_harmonics,
    ) * amplitudes;
    let mut response = Array2::zeros((CHANNELS, SAMPLES));
    response
        .slice_mut(s![.., LATENCY..])
        .assign(&mixing.dot(&reference));
    response
}

/// The post-latency segment of one recorded trial as a scoring window.
pub fn trial_window(data: &CalibrationData, natural: usize, block: usize) -> EegWindow {
    shifted_window(data, natural, block, 0, SAMPLES - LATENCY)
}

/// `len` samples of a recorded trial starting `shift` samples after the latency.
pub fn shifted_window(
    data: &CalibrationData,
    natural: usize,
    block: usize,
    shift: usize,
    len: usize,
) -> EegWindow {
    let start = LATENCY + shift;
    EegWindow {
        data: data
            .trial(natural, block)
            .unwrap()
            .slice(s![.., start..start + len])
            .to_owned(),
        sampling_rate: 250.0,
        start_sample: start,
        stimulus_offset: shift,
    }
}

pub struct Trained {
    pub data: CalibrationData,
    pub model: Model,
    pub report: TrainingReport,
}

/// Subject 7 trained on blocks 1 to 3, shared across tests.
pub fn trained() -> &'static Trained {
    static TRAINED: OnceLock<Trained> = OnceLock::new();
    TRAINED.get_or_init(|| {
        let data = synthetic_subject(7);
        let (model, report) =
            train_with_report(&data, &[1, 2, 3], &TlccaConfig::default()).unwrap();
        Trained {
            data,
            model,
            report,
        }
    })
}
