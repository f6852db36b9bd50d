//! Checkpoints: schedule state (JSON) plus optional parameters (safetensors).
//!
//! A checkpoint written after epoch `e` is stored as `checkpoint-{e}.json`
//! and, when parameters are attached, `checkpoint-{e}.safetensors` in the same
//! directory. `e` counts completed epochs, so it is also the epoch training
//! resumes at.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use ctrain_common::CertifiedTrainingConfig;
use ctrain_core::SchedulerState;
use serde::{Deserialize, Serialize};

const PREFIX: &str = "checkpoint-";

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("checkpoint {0} does not exist")]
    NotFound(PathBuf),

    #[error("no checkpoints found in {0}")]
    NoCheckpoints(PathBuf),

    #[error("checkpoint {path} is corrupted: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint {path} is named for epoch {file_epoch} but records epoch {recorded}")]
    EpochMismatch {
        path: PathBuf,
        file_epoch: usize,
        recorded: usize,
    },

    #[error(
        "checkpoint records epoch {epoch} but its scheduler is at step {step} \
         ({batches_per_epoch} batches per epoch)"
    )]
    SchedulerMismatch {
        epoch: usize,
        step: usize,
        batches_per_epoch: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Everything needed to continue a run at the next epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCheckpoint {
    /// Completed epochs; the epoch training resumes at.
    pub epoch: usize,
    pub running_loss: f64,
    /// Learning rate of the last trained batch.
    pub lr: f64,
    /// Raw epsilon the next batch will use.
    pub eps: f64,
    pub scheduler: SchedulerState,
    pub config: CertifiedTrainingConfig,
}

impl TrainingCheckpoint {
    pub fn json_path(dir: &Path, epoch: usize) -> PathBuf {
        dir.join(format!("{PREFIX}{epoch}.json"))
    }

    pub fn weights_path(dir: &Path, epoch: usize) -> PathBuf {
        dir.join(format!("{PREFIX}{epoch}.safetensors"))
    }

    fn validate(&self, path: &Path) -> Result<(), ResumeError> {
        if let Some(file_epoch) = epoch_from_path(path) {
            if file_epoch != self.epoch {
                return Err(ResumeError::EpochMismatch {
                    path: path.to_path_buf(),
                    file_epoch,
                    recorded: self.epoch,
                });
            }
        }
        let SchedulerState {
            step,
            batches_per_epoch,
        } = self.scheduler;
        if batches_per_epoch == 0 || step != self.epoch * batches_per_epoch {
            return Err(ResumeError::SchedulerMismatch {
                epoch: self.epoch,
                step,
                batches_per_epoch,
            });
        }
        Ok(())
    }

    /// Write to `dir`, creating it if needed. Returns the JSON path.
    ///
    /// The JSON is the commit marker: it is written last, into a temporary
    /// file renamed into place, so `latest` never sees a half-written one.
    pub fn save(&self, dir: &Path, varmap: Option<&VarMap>) -> Result<PathBuf, ResumeError> {
        std::fs::create_dir_all(dir)?;
        let weights = Self::weights_path(dir, self.epoch);
        if let Some(varmap) = varmap {
            varmap.save(&weights)?;
        }
        let path = Self::json_path(dir, self.epoch);
        if let Err(e) = self.write_json(dir, &path) {
            if varmap.is_some() {
                let _ = std::fs::remove_file(&weights);
            }
            return Err(e);
        }
        Ok(path)
    }

    fn write_json(&self, dir: &Path, path: &Path) -> Result<(), ResumeError> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".checkpoint")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Load and sanity-check a checkpoint file. Never falls back to epoch 0.
    pub fn load(path: &Path) -> Result<Self, ResumeError> {
        if !path.exists() {
            return Err(ResumeError::NotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path)?;
        let checkpoint: Self =
            serde_json::from_str(&json).map_err(|source| ResumeError::Corrupted {
                path: path.to_path_buf(),
                source,
            })?;
        checkpoint.validate(path)?;
        Ok(checkpoint)
    }

    /// Path of the highest-epoch checkpoint in `dir`.
    pub fn latest(dir: &Path) -> Result<PathBuf, ResumeError> {
        if !dir.is_dir() {
            return Err(ResumeError::NoCheckpoints(dir.to_path_buf()));
        }
        let mut best: Option<(usize, PathBuf)> = None;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(epoch) = epoch_from_path(&path) {
                if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
                    best = Some((epoch, path));
                }
            }
        }
        best.map(|(_, p)| p)
            .ok_or_else(|| ResumeError::NoCheckpoints(dir.to_path_buf()))
    }

    pub fn load_latest(dir: &Path) -> Result<Self, ResumeError> {
        Self::load(&Self::latest(dir)?)
    }

    /// Load the parameters stored next to this checkpoint into `varmap`.
    /// Returns `false` when the checkpoint was saved without parameters.
    pub fn restore_weights(&self, dir: &Path, varmap: &mut VarMap) -> Result<bool, ResumeError> {
        let path = Self::weights_path(dir, self.epoch);
        if !path.exists() {
            return Ok(false);
        }
        varmap.load(&path)?;
        Ok(true)
    }
}

/// `checkpoint-12.json` → `Some(12)`.
fn epoch_from_path(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix(PREFIX)?
        .parse()
        .ok()
}

// ── Tests ───────────────────────────────────────────────────────────────────
