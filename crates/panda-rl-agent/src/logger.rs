//! Training progress logging
//!
//! Each training run gets its own `<log_dir>/<prefix>_<n>` directory, `n`
//! being one past the highest index already present. Every rollout appends a
//! [`ProgressRecord`] as one JSON line to `progress.jsonl` in that directory
//! and emits the same values through `tracing`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// File name of the JSON-lines progress log inside a run directory
pub const PROGRESS_FILE: &str = "progress.jsonl";

/// Metrics of one rollout + update iteration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Rollouts collected so far
    #[serde(rename = "time/iterations")]
    pub iterations: u64,
    /// Environment steps so far
    #[serde(rename = "time/total_timesteps")]
    pub total_timesteps: u64,
    /// Seconds since training started
    #[serde(rename = "time/time_elapsed")]
    pub time_elapsed: f64,
    /// Environment steps per second
    #[serde(rename = "time/fps")]
    pub fps: f64,
    /// Mean return of the last 100 episodes
    #[serde(rename = "rollout/ep_rew_mean")]
    pub ep_rew_mean: Option<f64>,
    /// Mean length of the last 100 episodes
    #[serde(rename = "rollout/ep_len_mean")]
    pub ep_len_mean: Option<f64>,
    /// Success rate over the last 100 episodes
    #[serde(rename = "rollout/success_rate")]
    pub success_rate: Option<f64>,
    /// Clipped surrogate loss
    #[serde(rename = "train/policy_gradient_loss")]
    pub policy_gradient_loss: f32,
    /// Value regression loss
    #[serde(rename = "train/value_loss")]
    pub value_loss: f32,
    /// Negative entropy
    #[serde(rename = "train/entropy_loss")]
    pub entropy_loss: f32,
    /// Approximate KL divergence between the old and new policy
    #[serde(rename = "train/approx_kl")]
    pub approx_kl: f32,
    /// Fraction of ratios outside the clip range
    #[serde(rename = "train/clip_fraction")]
    pub clip_fraction: f32,
    /// Explained variance of the value predictions
    #[serde(rename = "train/explained_variance")]
    pub explained_variance: f32,
    /// Mean action standard deviation
    #[serde(rename = "train/std")]
    pub std: f32,
    /// Total loss of the last minibatch
    #[serde(rename = "train/loss")]
    pub loss: f32,
    /// Gradient epochs run so far
    #[serde(rename = "train/n_updates")]
    pub n_updates: u64,
    /// Optimizer step size
    #[serde(rename = "train/learning_rate")]
    pub learning_rate: f32,
}

/// Appends progress records to a per-run JSON-lines file
#[derive(Debug, Clone)]
pub struct ProgressLogger {
    run_dir: PathBuf,
    path: PathBuf,
}

impl ProgressLogger {
    /// Create the next `<log_dir>/<prefix>_<n>` run directory
    pub async fn create(log_dir: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)
            .await
            .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

        let run_id = latest_run_id(log_dir, prefix).await? + 1;
        let run_dir = log_dir.join(format!("{prefix}_{run_id}"));
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;

        info!(run_dir = %run_dir.display(), "logging training progress");
        Ok(Self {
            path: run_dir.join(PROGRESS_FILE),
            run_dir,
        })
    }

    /// Directory of this run
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Path of the progress file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Emit `record` through tracing and append it to the progress file
    pub async fn record(&self, record: &ProgressRecord) -> Result<()> {
        log_record(record);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(serde_json::to_string(record)?.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

/// Emit `record` through tracing only
pub fn log_record(record: &ProgressRecord) {
    info!(
        iterations = record.iterations,
        total_timesteps = record.total_timesteps,
        fps = record.fps,
        ep_rew_mean = ?record.ep_rew_mean,
        ep_len_mean = ?record.ep_len_mean,
        success_rate = ?record.success_rate,
        approx_kl = record.approx_kl,
        clip_fraction = record.clip_fraction,
        value_loss = record.value_loss,
        explained_variance = record.explained_variance,
        "rollout"
    );
}

/// Highest `n` among `<log_dir>/<prefix>_<n>` directories, `0` if none exist
pub async fn latest_run_id(log_dir: &Path, prefix: &str) -> Result<u32> {
    let mut latest = 0;
    let mut entries = match fs::read_dir(log_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let wanted = format!("{prefix}_");
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(id) = name
            .to_str()
            .and_then(|n| n.strip_prefix(&wanted))
            .and_then(|suffix| suffix.parse::<u32>().ok())
        else {
            continue;
        };
        latest = latest.max(id);
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_directories_are_numbered_past_the_highest() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("PPO_1")).await.unwrap();
        fs::create_dir_all(dir.path().join("PPO_7")).await.unwrap();
        fs::create_dir_all(dir.path().join("SAC_9")).await.unwrap();
        fs::write(dir.path().join("PPO_20"), b"file, not a run").await.unwrap();

        let logger = ProgressLogger::create(dir.path(), "PPO").await.unwrap();
        assert_eq!(logger.run_dir(), dir.path().join("PPO_8"));
        assert!(logger.run_dir().is_dir());
    }

    #[tokio::test]
    async fn first_run_is_one() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ProgressLogger::create(dir.path().join("logs"), "PPO").await.unwrap();
        assert!(logger.run_dir().ends_with("PPO_1"));
    }

    #[tokio::test]
    async fn records_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ProgressLogger::create(dir.path(), "PPO").await.unwrap();

        for i in 1..=2 {
            let record = ProgressRecord {
                iterations: i,
                total_timesteps: i * 8192,
                ep_rew_mean: Some(-12.5),
                ..ProgressRecord::default()
            };
            logger.record(&record).await.unwrap();
        }

        let text = fs::read_to_string(logger.path()).await.unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["time/total_timesteps"], 16384);
        assert_eq!(lines[0]["rollout/ep_rew_mean"], -12.5);
        assert!(lines[0]["rollout/success_rate"].is_null());
    }
}
