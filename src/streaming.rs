//! Append-only sample buffer and the windows cut from it during recognition.

use ndarray::{Array2, ArrayView2};

use crate::config::SessionConfig;
use crate::error::{Result, TlccaError};

/// A `channels × samples` slice of the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EegWindow {
    pub data: Array2<f64>,
    pub sampling_rate: f64,
    /// Position of the first sample in the stream.
    pub start_sample: usize,
    /// Samples between the stimulus-locked origin (flicker onset plus
    /// latency) and the first sample. References and transfer templates
    /// are read from this offset on.
    pub stimulus_offset: usize,
}

impl EegWindow {
    pub fn num_samples(&self) -> usize {
        self.data.ncols()
    }

    pub fn duration(&self) -> f64 {
        self.num_samples() as f64 / self.sampling_rate
    }
}

/// Outcome of polling the buffer for a window.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowPoll {
    Ready(EegWindow),
    /// The window ends past what has been received so far.
    NotReady { available: usize, required: usize },
}

/// Accumulates multichannel samples and hands out read-only copies of
/// complete windows.
///
/// Samples are only ever appended; a window is returned only when every one
/// of its samples is already in the buffer.
#[derive(Debug, Clone)]
pub struct StreamingWindower {
    sampling_rate: f64,
    channels: Vec<Vec<f64>>,
}

impl StreamingWindower {
    pub fn new(num_channels: usize, sampling_rate: f64) -> Self {
        Self {
            sampling_rate,
            channels: vec![Vec::new(); num_channels],
        }
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples received so far.
    pub fn received(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Appends a `channels × n` block and returns the new sample count.
    pub fn push_samples(&mut self, samples: ArrayView2<f64>) -> Result<usize> {
        if samples.nrows() != self.channels.len() {
            return Err(TlccaError::InvalidInput(format!(
                "pushed {} channels into a {}-channel stream",
                samples.nrows(),
                self.channels.len()
            )));
        }
        for (buffer, row) in self.channels.iter_mut().zip(samples.rows()) {
            buffer.extend(row.iter().copied());
        }
        Ok(self.received())
    }

    /// Sample index of a stream time, truncated towards zero.
    pub fn sample_at(&self, seconds: f64) -> usize {
        (seconds.max(0.0) * self.sampling_rate) as usize
    }

    /// Window `[t_start, t_end)` in seconds since the stream began.
    pub fn extract_window(&self, t_start: f64, t_end: f64) -> Result<WindowPoll> {
        self.extract_samples(self.sample_at(t_start), self.sample_at(t_end))
    }

    /// Window `[start, end)` in samples.
    pub fn extract_samples(&self, start: usize, end: usize) -> Result<WindowPoll> {
        if start >= end {
            return Err(TlccaError::InvalidInput(format!(
                "empty window [{start}, {end})"
            )));
        }
        let available = self.received();
        if end > available {
            return Ok(WindowPoll::NotReady {
                available,
                required: end,
            });
        }
        let data = Array2::from_shape_fn((self.channels.len(), end - start), |(c, t)| {
            self.channels[c][start + t]
        });
        Ok(WindowPoll::Ready(EegWindow {
            data,
            sampling_rate: self.sampling_rate,
            start_sample: start,
            stimulus_offset: 0,
        }))
    }
}

/// Where, inside a replayed session, recognition windows are taken.
///
/// Trials follow each other every `trial_duration` seconds. Recognition runs
/// from `cue + latency` to `cue + flicker` after trial onset; each window
/// ends now, is at most `window` long and never reaches back before the
/// recognition start of its trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognitionSchedule {
    pub sampling_rate: f64,
    pub window: f64,
    pub cue_duration: f64,
    pub latency: f64,
    pub flicker_duration: f64,
    pub trial_duration: f64,
}

/// A window the schedule wants scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedWindow {
    /// 0-based trial within the replayed stream.
    pub trial: usize,
    pub start_sample: usize,
    pub end_sample: usize,
    /// `start_sample` relative to the recognition start of the trial.
    pub stimulus_offset: usize,
}

impl RecognitionSchedule {
    pub fn from_session(session: &SessionConfig) -> Self {
        Self {
            sampling_rate: session.algorithm.sampling_rate,
            window: session.window,
            cue_duration: session.cue_duration,
            latency: session.algorithm.latency_delay,
            flicker_duration: session.flicker_duration,
            trial_duration: session.trial_duration,
        }
    }

    /// Fewest samples worth scoring: `max(0.2 s, 0.8·window)`.
    pub fn min_samples(&self) -> usize {
        (0.2f64.max(0.8 * self.window) * self.sampling_rate) as usize
    }

    /// The window to score at stream time `now`, if any.
    pub fn plan(&self, now: f64) -> Option<PlannedWindow> {
        if now < 0.0 || self.trial_duration <= 0.0 {
            return None;
        }
        let trial = (now / self.trial_duration).floor() as usize;
        let trial_start = trial as f64 * self.trial_duration;
        let relative = now - trial_start;
        let recognition_start = self.cue_duration + self.latency;
        let recognition_end = self.cue_duration + self.flicker_duration;
        if relative < recognition_start || relative > recognition_end {
            return None;
        }

        let onset = trial_start + recognition_start;
        let window_start = (now - self.window).max(onset);
        let start_sample = (window_start * self.sampling_rate) as usize;
        let onset_sample = (onset * self.sampling_rate) as usize;
        let end_sample = (now * self.sampling_rate) as usize;
        if end_sample < start_sample + self.min_samples() || end_sample == start_sample {
            return None;
        }
        Some(PlannedWindow {
            trial,
            start_sample,
            end_sample,
            stimulus_offset: start_sample.saturating_sub(onset_sample),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn ramp(channels: usize, from: usize, len: usize) -> Array2<f64> {
        Array::from_shape_fn((channels, len), |(c, t)| (c * 1000 + from + t) as f64)
    }

    #[test]
    fn windows_wait_for_their_last_sample() {
        let mut stream = StreamingWindower::new(2, 250.0);
        assert_eq!(stream.push_samples(ramp(2, 0, 100).view()).unwrap(), 100);

        assert_eq!(
            stream.extract_samples(50, 150).unwrap(),
            WindowPoll::NotReady {
                available: 100,
                required: 150
            }
        );

        stream.push_samples(ramp(2, 100, 50).view()).unwrap();
        let WindowPoll::Ready(window) = stream.extract_samples(50, 150).unwrap() else {
            panic!("window should be complete");
        };
        assert_eq!(window.start_sample, 50);
        assert_eq!(window.stimulus_offset, 0);
        assert_eq!(window.data.dim(), (2, 100));
        assert_eq!(window.data[[0, 0]], 50.0);
        assert_eq!(window.data[[1, 99]], 1149.0);
        assert!((window.duration() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn time_bounds_truncate_to_samples() {
        let mut stream = StreamingWindower::new(1, 250.0);
        stream.push_samples(ramp(1, 0, 500).view()).unwrap();
        let WindowPoll::Ready(window) = stream.extract_window(0.5, 1.0).unwrap() else {
            panic!("window should be complete");
        };
        assert_eq!(window.start_sample, 125);
        assert_eq!(window.num_samples(), 125);
        assert!(stream.extract_window(1.0, 1.0).is_err());
    }

    #[test]
    fn channel_count_is_enforced() {
        let mut stream = StreamingWindower::new(3, 250.0);
        assert!(stream.push_samples(ramp(2, 0, 10).view()).is_err());
        assert_eq!(stream.received(), 0);
    }

    fn schedule() -> RecognitionSchedule {
        RecognitionSchedule {
            sampling_rate: 250.0,
            window: 0.8,
            cue_duration: 0.5,
            latency: 0.13,
            flicker_duration: 2.0,
            trial_duration: 3.0,
        }
    }

    #[test]
    fn recognition_waits_for_enough_flicker() {
        let schedule = schedule();
        assert_eq!(schedule.min_samples(), 160);
        // Cue and latency.
        assert_eq!(schedule.plan(0.6), None);
        // Only 0.37 s of flicker so far.
        assert_eq!(schedule.plan(1.0), None);

        let planned = schedule.plan(1.5).unwrap();
        assert_eq!(planned.trial, 0);
        assert_eq!(planned.end_sample, 375);
        assert_eq!(planned.start_sample, 175);
        assert_eq!(planned.stimulus_offset, 18);
        // After the flicker ends.
        assert_eq!(schedule.plan(2.6), None);
    }

    #[test]
    fn windows_stay_inside_their_trial() {
        let schedule = schedule();
        let planned = schedule.plan(3.0 + 2.4).unwrap();
        assert_eq!(planned.trial, 1);
        assert_eq!(planned.end_sample, 1350);
        assert_eq!(planned.start_sample, 1150);
        assert_eq!(planned.stimulus_offset, 243);
        assert!(planned.start_sample >= ((3.0 + 0.63) * 250.0) as usize);
    }
}
