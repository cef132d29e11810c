//! Checkpoint persistence
//!
//! A checkpoint is the complete trainable state of a [`crate::Ppo`] learner,
//! serialized with `bincode` and gzip-compressed. The first field is the
//! format version so that incompatible files are rejected before the rest is
//! decoded.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use panda_rl_core::{BoxSpace, RLError};

use crate::optim::Adam;
use crate::policy::ActorCriticPolicy;
use crate::ppo::PpoConfig;

/// Version written into every checkpoint
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Algorithm tag written into every checkpoint
pub const ALGORITHM: &str = "PPO";

/// Periodic checkpoint file name, `<prefix>_<timesteps>_steps.zip`
#[must_use]
pub fn periodic_checkpoint_name(prefix: &str, num_timesteps: u64) -> String {
    format!("{prefix}_{num_timesteps}_steps.zip")
}

/// Final checkpoint file name, `<prefix>_final.zip`
#[must_use]
pub fn final_checkpoint_name(prefix: &str) -> String {
    format!("{prefix}_final.zip")
}

/// Full trainable state of a PPO learner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Layout version, always first
    pub format_version: u32,
    /// Algorithm tag
    pub algorithm: String,
    /// Environment id the policy was trained on
    pub env_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Environment steps taken, across all environments
    pub num_timesteps: u64,
    /// Gradient epochs run
    pub n_updates: u64,
    /// Hyperparameters
    pub config: PpoConfig,
    /// Declared observation space
    pub observation_space: BoxSpace,
    /// Declared action space
    pub action_space: BoxSpace,
    /// Network parameters
    pub policy: ActorCriticPolicy,
    /// Optimizer moments
    pub optimizer: Adam,
}

impl Checkpoint {
    /// Encode to compressed bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let data = bincode::serialize(self).context("failed to serialize checkpoint")?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data)?;
        Ok(encoder.finish()?)
    }

    /// Decode from compressed bytes, checking version and internal consistency
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut decoder = GzDecoder::new(bytes);
        let mut data = Vec::new();
        decoder
            .read_to_end(&mut data)
            .map_err(|e| RLError::Checkpoint(format!("not a compressed checkpoint: {e}")))?;

        let version: u32 = bincode::deserialize(&data)
            .map_err(|e| RLError::Checkpoint(format!("truncated checkpoint header: {e}")))?;
        if version != CHECKPOINT_FORMAT_VERSION {
            bail!(RLError::Checkpoint(format!(
                "unsupported checkpoint format version {version}, expected {CHECKPOINT_FORMAT_VERSION}"
            )));
        }

        let checkpoint: Self = bincode::deserialize(&data)
            .map_err(|e| RLError::Checkpoint(format!("corrupt checkpoint: {e}")))?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    fn validate(&self) -> Result<()> {
        if self.algorithm != ALGORITHM {
            bail!(RLError::Checkpoint(format!(
                "checkpoint holds a {} model, expected {ALGORITHM}",
                self.algorithm
            )));
        }
        if self.policy.obs_dim() != self.observation_space.flat_dim()
            || self.policy.act_dim() != self.action_space.flat_dim()
        {
            bail!(RLError::Checkpoint(format!(
                "policy maps {} → {} but the declared spaces are {} → {}",
                self.policy.obs_dim(),
                self.policy.act_dim(),
                self.observation_space.flat_dim(),
                self.action_space.flat_dim()
            )));
        }
        if self.optimizer.len() != self.policy.num_parameters() {
            bail!(RLError::Checkpoint(
                "optimizer state does not match the policy parameters".to_string()
            ));
        }
        Ok(())
    }

    /// Write atomically to `path`, creating parent directories
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = tmp_path(path);
        fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to move checkpoint into {}", path.display()))?;

        info!(
            path = %path.display(),
            num_timesteps = self.num_timesteps,
            bytes = bytes.len(),
            "saved checkpoint"
        );
        Ok(())
    }

    /// Read and decode a checkpoint file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        let checkpoint = Self::from_bytes(&bytes)
            .with_context(|| format!("failed to load checkpoint {}", path.display()))?;
        debug!(
            path = %path.display(),
            env_id = %checkpoint.env_id,
            num_timesteps = checkpoint.num_timesteps,
            "loaded checkpoint"
        );
        Ok(checkpoint)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NetArch;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn checkpoint() -> Checkpoint {
        let mut rng = StdRng::seed_from_u64(0);
        let policy = ActorCriticPolicy::new(12, 3, &NetArch::default(), 0.0, &mut rng);
        let optimizer = Adam::new(policy.num_parameters(), 3e-4, 1e-5);
        Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            algorithm: ALGORITHM.to_string(),
            env_id: "PandaReach-v3".to_string(),
            created_at: Utc::now(),
            num_timesteps: 10_000,
            n_updates: 10,
            config: PpoConfig::default(),
            observation_space: BoxSpace::uniform(-10.0, 10.0, vec![12]),
            action_space: BoxSpace::uniform(-1.0, 1.0, vec![3]),
            policy,
            optimizer,
        }
    }

    #[test]
    fn file_names_follow_the_step_convention() {
        assert_eq!(
            periodic_checkpoint_name("ppo_panda_reach", 10_000),
            "ppo_panda_reach_10000_steps.zip"
        );
        assert_eq!(final_checkpoint_name("ppo_panda_reach"), "ppo_panda_reach_final.zip");
    }

    #[test]
    fn bytes_round_trip() {
        let original = checkpoint();
        let decoded = Checkpoint::from_bytes(&original.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut ckpt = checkpoint();
        ckpt.format_version = 99;
        let err = Checkpoint::from_bytes(&ckpt.to_bytes().unwrap()).unwrap_err();
        assert!(err.to_string().contains("format version 99"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Checkpoint::from_bytes(b"definitely not gzip").is_err());
    }

    #[test]
    fn inconsistent_spaces_are_rejected() {
        let mut ckpt = checkpoint();
        ckpt.observation_space = BoxSpace::uniform(-10.0, 10.0, vec![6]);
        let err = Checkpoint::from_bytes(&ckpt.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RLError>(),
            Some(RLError::Checkpoint(_))
        ));
    }

    #[tokio::test]
    async fn save_creates_directories_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("ppo_panda_reach_final.zip");
        let original = checkpoint();
        original.save(&path).await.unwrap();

        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
        let loaded = Checkpoint::load(&path).await.unwrap();
        assert_eq!(loaded.policy, original.policy);
    }

    #[tokio::test]
    async fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.zip");
        let err = Checkpoint::load(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("nope.zip"));
    }
}
