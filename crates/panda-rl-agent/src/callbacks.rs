//! Training callbacks

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use panda_rl_core::RLError;

use crate::checkpoint::periodic_checkpoint_name;
use crate::ppo::Ppo;

/// Hooks invoked by [`Ppo::learn`]
#[async_trait]
pub trait Callback: Send {
    /// Called once before the first rollout
    async fn on_training_start(&mut self, _model: &Ppo) -> Result<()> {
        Ok(())
    }

    /// Called after every vectorized environment step; `false` stops training
    async fn on_step(&mut self, model: &Ppo) -> Result<bool>;

    /// Called once after the last update
    async fn on_training_end(&mut self, _model: &Ppo) -> Result<()> {
        Ok(())
    }
}

/// Callback that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallback;

#[async_trait]
impl Callback for NoopCallback {
    async fn on_step(&mut self, _model: &Ppo) -> Result<bool> {
        Ok(true)
    }
}

/// Saves a checkpoint every `save_freq` environment steps
///
/// Steps are counted across all environments. A checkpoint is written on the
/// first step at or past each multiple of `save_freq` and named
/// `<name_prefix>_<num_timesteps>_steps.zip`.
#[derive(Debug, Clone)]
pub struct CheckpointCallback {
    save_freq: u64,
    save_path: PathBuf,
    name_prefix: String,
    last_bucket: u64,
    saved: Vec<PathBuf>,
}

impl CheckpointCallback {
    /// Checkpoint into `save_path` every `save_freq` steps
    pub fn new(save_freq: u64, save_path: impl AsRef<Path>, name_prefix: impl Into<String>) -> Result<Self> {
        if save_freq == 0 {
            bail!(RLError::Config("save_freq must be at least 1".to_string()));
        }
        Ok(Self {
            save_freq,
            save_path: save_path.as_ref().to_path_buf(),
            name_prefix: name_prefix.into(),
            last_bucket: 0,
            saved: Vec::new(),
        })
    }

    /// Checkpoints written so far, oldest first
    #[must_use]
    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }
}

#[async_trait]
impl Callback for CheckpointCallback {
    async fn on_training_start(&mut self, model: &Ppo) -> Result<()> {
        self.last_bucket = model.num_timesteps() / self.save_freq;
        tokio::fs::create_dir_all(&self.save_path).await?;
        Ok(())
    }

    async fn on_step(&mut self, model: &Ppo) -> Result<bool> {
        let bucket = model.num_timesteps() / self.save_freq;
        if bucket > self.last_bucket {
            self.last_bucket = bucket;
            let path = self
                .save_path
                .join(periodic_checkpoint_name(&self.name_prefix, model.num_timesteps()));
            debug!(path = %path.display(), "periodic checkpoint");
            model.save(&path).await?;
            self.saved.push(path);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_frequency_is_rejected() {
        assert!(CheckpointCallback::new(0, "models", "ppo").is_err());
    }
}
