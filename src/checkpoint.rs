use crate::error::{Result, StarganError};
use burn::module::Module;
use burn::prelude::*;
use burn::record::{CompactRecorder, FileRecorder, Record, Recorder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persisted progress used to resume training and to find the latest checkpoint.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct TrainingState {
    pub iteration: usize,
    pub g_lr: f64,
    pub d_lr: f64,
}

/// Network weights and optimizer records keyed by iteration, e.g. `1000-G.mpk`.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    recorder: CompactRecorder,
}

impl CheckpointStore {
    pub const STATE_FILE: &'static str = "state.json";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            recorder: CompactRecorder::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path without the recorder extension, e.g. `<dir>/1000-G`.
    pub fn entry_path(&self, iteration: usize, name: &str) -> PathBuf {
        self.dir.join(format!("{iteration}-{name}"))
    }

    fn file_path<B: Backend>(&self, iteration: usize, name: &str) -> PathBuf {
        self.entry_path(iteration, name)
            .with_extension(<CompactRecorder as FileRecorder<B>>::file_extension())
    }

    pub fn contains<B: Backend>(&self, iteration: usize, name: &str) -> bool {
        self.file_path::<B>(iteration, name).is_file()
    }

    pub fn save_module<B: Backend, M: Module<B>>(&self, module: &M, iteration: usize, name: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        module
            .clone()
            .save_file(self.entry_path(iteration, name), &self.recorder)?;
        Ok(())
    }

    pub fn load_module<B: Backend, M: Module<B>>(
        &self,
        module: M,
        iteration: usize,
        name: &str,
        device: &B::Device,
    ) -> Result<M> {
        self.require::<B>(iteration, name)?;
        Ok(module.load_file(self.entry_path(iteration, name), &self.recorder, device)?)
    }

    pub fn save_record<B: Backend, R: Record<B>>(&self, record: R, iteration: usize, name: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Recorder::<B>::record(&self.recorder, record, self.entry_path(iteration, name))?;
        Ok(())
    }

    pub fn load_record<B: Backend, R: Record<B>>(
        &self,
        iteration: usize,
        name: &str,
        device: &B::Device,
    ) -> Result<R> {
        self.require::<B>(iteration, name)?;
        Ok(Recorder::<B>::load(&self.recorder, self.entry_path(iteration, name), device)?)
    }

    fn require<B: Backend>(&self, iteration: usize, name: &str) -> Result<()> {
        let path = self.file_path::<B>(iteration, name);
        if path.is_file() {
            Ok(())
        } else {
            Err(StarganError::MissingCheckpoint(path))
        }
    }

    pub fn write_state(&self, state: &TrainingState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let state_json = serde_json::to_string_pretty(state)?;
        std::fs::write(self.dir.join(Self::STATE_FILE), state_json)?;
        Ok(())
    }

    pub fn read_state(&self) -> Result<Option<TrainingState>> {
        let path = self.dir.join(Self::STATE_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Latest saved iteration from `state.json`, falling back to scanning generator files.
    pub fn latest_iteration(&self) -> Result<Option<usize>> {
        if let Some(state) = self.read_state()? {
            return Ok(Some(state.iteration));
        }
        let pattern = self.dir.join("*-G.*");
        let latest = glob::glob(&pattern.to_string_lossy())
            .map_err(|err| StarganError::config(format!("invalid checkpoint directory: {err}")))?
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?.to_string();
                stem.strip_suffix("-G")?.parse::<usize>().ok()
            })
            .max();
        Ok(latest)
    }
}
