use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use eyre::{bail, WrapErr};
use ndarray::{concatenate, s, Array2, Axis};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use tlcca_speller::io::{EegSource, JsonModelStore, ModelStore, NpyEegSource, SessionKey, Trial};
use tlcca_speller::streaming::RecognitionSchedule;
use tlcca_speller::{
    train_with_report, Model, OnlineScorer, SessionConfig, StreamingWindower, TlccaError,
    WindowPoll, BENCHMARK_SYMBOLS,
};

fn load_session() -> eyre::Result<SessionConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("reading session config {path}"))?;
            Ok(SessionConfig::from_json(&json)?)
        }
        None => Ok(SessionConfig::default()),
    }
}

/// Loads the stored model for this split, training and saving one if missing.
fn load_or_train(session: &SessionConfig, source: &NpyEegSource) -> eyre::Result<Model> {
    let key = SessionKey::from_session(session);
    let store = JsonModelStore::new(session.model_dir.clone());
    match store.load(&key) {
        Ok(model) => return Ok(model),
        Err(TlccaError::NotFound(path)) => info!("No stored model at {path}, training"),
        Err(err) => return Err(err.into()),
    }

    let blocks = key.training_blocks(session.layout.blocks);
    let data = source.calibration(session.subject, &blocks)?;
    let started = Instant::now();
    let (model, report) = train_with_report(&data, &blocks, &session.algorithm)?;
    info!(
        "Trained in {:.1?}: ALS converged {}/{}",
        started.elapsed(),
        report.converged(),
        report.total()
    );
    store.save(&key, &model)?;
    Ok(model)
}

fn stream_of(trials: &[Trial]) -> eyre::Result<Array2<f64>> {
    let views: Vec<_> = trials.iter().map(|t| t.data.view()).collect();
    Ok(concatenate(Axis(1), &views)?)
}

fn majority(decisions: &[usize]) -> Option<usize> {
    let mut counts = BTreeMap::new();
    for &d in decisions {
        *counts.entry(d).or_insert(0usize) += 1;
    }
    // Ties go to the lowest symbol index.
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(symbol, _)| symbol)
}

/// Hit counter over scored windows.
#[derive(Debug, Default)]
struct Tally {
    windows: usize,
    hits: usize,
}

impl Tally {
    fn record(&mut self, predicted: usize, expected: usize) {
        self.windows += 1;
        self.hits += usize::from(predicted == expected);
    }

    fn percent(&self) -> f64 {
        if self.windows == 0 {
            return 0.0;
        }
        100.0 * self.hits as f64 / self.windows as f64
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let session = load_session()?;
    let source = NpyEegSource::from_session(&session);
    let model = load_or_train(&session, &source)?;
    let scorer = OnlineScorer::new(&model)?;

    let trials = source.trials(session.subject, &session.held_out_blocks)?;
    if trials.is_empty() {
        bail!("no trials to replay for blocks {:?}", session.held_out_blocks);
    }
    let stream = stream_of(&trials)?;
    let fs = session.algorithm.sampling_rate;
    let schedule = RecognitionSchedule::from_session(&session);
    let total_duration = trials.len() as f64 * session.trial_duration;
    info!(
        "Replaying {} trials ({:.0} s) of subject {}",
        trials.len(),
        total_duration,
        session.subject
    );

    let mut windower = StreamingWindower::new(stream.nrows(), fs);
    let mut decisions: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut realtime = Tally::default();
    let mut ticker = interval(Duration::from_millis(session.update_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();

    loop {
        ticker.tick().await;
        let now = started.elapsed().as_secs_f64();
        if now > total_duration {
            break;
        }

        let due = ((now * fs) as usize).min(stream.ncols());
        let received = windower.received();
        if due > received {
            windower.push_samples(stream.slice(s![.., received..due]))?;
        }

        let Some(planned) = schedule.plan(now) else {
            continue;
        };
        let mut window = match windower.extract_samples(planned.start_sample, planned.end_sample)? {
            WindowPoll::Ready(window) => window,
            WindowPoll::NotReady {
                available,
                required,
            } => {
                debug!("Window not ready: {available}/{required} samples");
                continue;
            }
        };

        window.stimulus_offset = planned.stimulus_offset;

        let tick = Instant::now();
        let ranking = scorer.rank_window(&window)?;
        let Some(best) = ranking.best() else {
            continue;
        };
        let expected = trials[planned.trial].symbol;
        info!(
            "t={:.2}s trial {} window {}..{}: predicted '{}', expected '{}' ({:.1?})",
            now,
            planned.trial,
            planned.start_sample,
            planned.end_sample,
            BENCHMARK_SYMBOLS[best],
            BENCHMARK_SYMBOLS[expected],
            tick.elapsed()
        );
        decisions.entry(planned.trial).or_default().push(best);
        realtime.record(best, expected);
    }

    let mut correct = 0;
    for (index, trial) in trials.iter().enumerate() {
        match decisions.get(&index).and_then(|d| majority(d)) {
            Some(symbol) => {
                let hit = symbol == trial.symbol;
                correct += usize::from(hit);
                info!(
                    "Block {} trial {}: '{}' for '{}'{}",
                    trial.block,
                    index,
                    BENCHMARK_SYMBOLS[symbol],
                    BENCHMARK_SYMBOLS[trial.symbol],
                    if hit { "" } else { " (miss)" }
                );
            }
            None => warn!("Trial {index} produced no decision"),
        }
    }
    info!(
        "Real-time accuracy {}/{} windows ({:.1}%)",
        realtime.hits,
        realtime.windows,
        realtime.percent()
    );
    info!(
        "Trial accuracy {}/{} ({:.1}%)",
        correct,
        trials.len(),
        100.0 * correct as f64 / trials.len() as f64
    );
    Ok(())
}
