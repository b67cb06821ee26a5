//! Persistence of models and access to recorded EEG.

use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::{s, Array2, Array4};
use npy::NpyData;
use tracing::{debug, info};

use crate::calibration::CalibrationData;
use crate::config::{SessionConfig, TensorLayout};
use crate::error::{Result, TlccaError};
use crate::model::Model;

/// Identifies one subject and calibration split.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub subject: u32,
    /// 1-based blocks excluded from calibration.
    pub held_out_blocks: Vec<usize>,
}

impl SessionKey {
    pub fn new(subject: u32, held_out_blocks: &[usize]) -> Self {
        Self {
            subject,
            held_out_blocks: held_out_blocks.to_vec(),
        }
    }

    pub fn from_session(session: &SessionConfig) -> Self {
        Self::new(session.subject, &session.held_out_blocks)
    }

    /// `S{subject}_tlcca_model_exclude_{blocks}.json`
    pub fn model_file_name(&self) -> String {
        let blocks: Vec<String> = self.held_out_blocks.iter().map(usize::to_string).collect();
        format!(
            "S{}_tlcca_model_exclude_{}.json",
            self.subject,
            blocks.join("_")
        )
    }

    /// Blocks `1..=num_blocks` not held out.
    pub fn training_blocks(&self, num_blocks: usize) -> Vec<usize> {
        (1..=num_blocks)
            .filter(|b| !self.held_out_blocks.contains(b))
            .collect()
    }
}

pub trait ModelStore {
    /// Fails with [`TlccaError::NotFound`] if no model was stored under `key`.
    fn load(&self, key: &SessionKey) -> Result<Model>;
    fn save(&self, key: &SessionKey, model: &Model) -> Result<()>;
}

/// One JSON file per session key in a directory.
pub struct JsonModelStore {
    dir: PathBuf,
}

impl JsonModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(key.model_file_name())
    }
}

impl ModelStore for JsonModelStore {
    fn load(&self, key: &SessionKey) -> Result<Model> {
        let path = self.path(key);
        if !path.exists() {
            return Err(TlccaError::NotFound(path.display().to_string()));
        }
        let model = Model::from_json(&std::fs::read_to_string(&path)?)?;
        info!("Loaded model from {}", path.display());
        Ok(model)
    }

    fn save(&self, key: &SessionKey, model: &Model) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(key);
        std::fs::write(&path, model.to_json()?)?;
        info!("Saved model to {}", path.display());
        Ok(())
    }
}

/// One recorded trial, `channels × samples`, cue included.
#[derive(Debug, Clone)]
pub struct Trial {
    /// 1-based block.
    pub block: usize,
    /// Natural index of the attended symbol.
    pub symbol: usize,
    pub data: Array2<f64>,
}

pub trait EegSource {
    /// Calibration tensor `[channels, time, stimulus, block]` cut to the
    /// post-cue segment. Every requested block must exist.
    fn calibration(&self, subject: u32, blocks: &[usize]) -> Result<CalibrationData>;

    /// Complete trials of the given blocks, block by block in symbol order.
    fn trials(&self, subject: u32, blocks: &[usize]) -> Result<Vec<Trial>>;
}

/// Reads `S{subject}.npy` holding a flat C-order `[channels, time, stimulus, block]` tensor.
pub struct NpyEegSource {
    dir: PathBuf,
    layout: TensorLayout,
    calibration_range: Range<usize>,
}

impl NpyEegSource {
    pub fn new(dir: impl Into<PathBuf>, layout: TensorLayout, calibration_range: Range<usize>) -> Self {
        Self {
            dir: dir.into(),
            layout,
            calibration_range,
        }
    }

    pub fn from_session(session: &SessionConfig) -> Self {
        Self::new(
            session.data_dir.clone(),
            session.layout,
            session.calibration_range(),
        )
    }

    pub fn path(&self, subject: u32) -> PathBuf {
        self.dir.join(format!("S{subject}.npy"))
    }

    fn load(&self, subject: u32) -> Result<Array4<f64>> {
        let path = self.path(subject);
        let data = read_npy(&path)?;
        let layout = self.layout;
        let expected = layout.channels * layout.samples * layout.stimuli * layout.blocks;
        if data.len() != expected {
            return Err(TlccaError::InvalidInput(format!(
                "{} holds {} values, layout {:?} needs {}",
                path.display(),
                data.len(),
                layout,
                expected
            )));
        }
        debug!("Read {} values from {}", data.len(), path.display());
        Ok(Array4::from_shape_vec(
            (layout.channels, layout.samples, layout.stimuli, layout.blocks),
            data,
        )?)
    }

    fn check_blocks(&self, blocks: &[usize]) -> Result<()> {
        match blocks.iter().find(|&&b| b == 0 || b > self.layout.blocks) {
            Some(block) => Err(TlccaError::NotFound(format!(
                "block {block} (recording has {})",
                self.layout.blocks
            ))),
            None => Ok(()),
        }
    }
}

impl EegSource for NpyEegSource {
    fn calibration(&self, subject: u32, blocks: &[usize]) -> Result<CalibrationData> {
        self.check_blocks(blocks)?;
        let range = self.calibration_range.clone();
        if range.end > self.layout.samples {
            return Err(TlccaError::InvalidInput(format!(
                "calibration segment {:?} exceeds the {}-sample trials",
                range, self.layout.samples
            )));
        }
        let eeg = self.load(subject)?;
        let cut = eeg.slice(s![.., range, .., ..]).to_owned();
        CalibrationData::new(cut, self.layout.stimuli)
    }

    fn trials(&self, subject: u32, blocks: &[usize]) -> Result<Vec<Trial>> {
        self.check_blocks(blocks)?;
        let eeg = self.load(subject)?;
        let mut trials = Vec::with_capacity(blocks.len() * self.layout.stimuli);
        for &block in blocks {
            for symbol in 0..self.layout.stimuli {
                trials.push(Trial {
                    block,
                    symbol,
                    data: eeg.slice(s![.., .., symbol, block - 1]).to_owned(),
                });
            }
        }
        Ok(trials)
    }
}

fn read_npy(path: &Path) -> Result<Vec<f64>> {
    if !path.exists() {
        return Err(TlccaError::NotFound(path.display().to_string()));
    }
    let mut buf = vec![];
    File::open(path)?.read_to_end(&mut buf)?;
    Ok(NpyData::<f64>::from_bytes(&buf)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::random_model;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tlcca-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn model_file_names_follow_held_out_blocks() {
        let key = SessionKey::new(3, &[2, 4]);
        assert_eq!(key.model_file_name(), "S3_tlcca_model_exclude_2_4.json");
        assert_eq!(key.training_blocks(4), vec![1, 3]);
    }

    #[test]
    fn json_store_round_trip_and_missing_key() {
        let store = JsonModelStore::new(scratch_dir("store"));
        let key = SessionKey::new(1, &[4]);
        let model = random_model(3, 21);
        store.save(&key, &model).unwrap();
        assert_eq!(store.load(&key).unwrap(), model);
        assert!(matches!(
            store.load(&SessionKey::new(2, &[4])),
            Err(TlccaError::NotFound(_))
        ));
        std::fs::remove_file(store.path(&key)).unwrap();
    }

    #[test]
    fn npy_source_cuts_calibration_and_splits_trials() {
        let dir = scratch_dir("npy");
        let layout = TensorLayout {
            channels: 2,
            samples: 12,
            stimuli: 3,
            blocks: 2,
        };
        let total = layout.channels * layout.samples * layout.stimuli * layout.blocks;
        let values: Vec<f64> = (0..total).map(|v| v as f64).collect();
        let source = NpyEegSource::new(&dir, layout, 2..10);
        npy::to_file(source.path(5), values).unwrap();

        let calibration = source.calibration(5, &[1, 2]).unwrap();
        assert_eq!(calibration.samples(), 8);
        assert_eq!(calibration.num_blocks(), 2);
        // [c=0, t=2, stim=1, block=2] sits at 2·6 + 1·2 + 1 in C order.
        assert_eq!(calibration.trial(1, 2).unwrap()[[0, 0]], 15.0);

        let trials = source.trials(5, &[2]).unwrap();
        assert_eq!(trials.len(), 3);
        assert_eq!(trials[1].block, 2);
        assert_eq!(trials[1].symbol, 1);
        assert_eq!(trials[1].data.dim(), (2, 12));

        assert!(matches!(source.calibration(5, &[3]), Err(TlccaError::NotFound(_))));
        assert!(matches!(source.trials(6, &[1]), Err(TlccaError::NotFound(_))));
        std::fs::remove_file(source.path(5)).unwrap();
    }
}
