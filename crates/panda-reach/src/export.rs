//! Export stage: final checkpoint → ONNX model → optional public copy

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use panda_rl_agent::Checkpoint;
use panda_rl_core::RLError;
use panda_rl_onnx::{export_onnx, ExportSummary, InferencePolicy, OnnxExportOptions};

/// Everything the export stage needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Checkpoint to export
    pub model_path: PathBuf,
    /// Written ONNX model
    pub output_path: PathBuf,
    /// Copy the model to `public_path` after a successful export
    pub copy_to_public: bool,
    /// Destination of the public copy
    pub public_path: PathBuf,
    /// Seed for the dummy trace input
    pub seed: Option<u64>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/ppo_panda_reach_final.zip"),
            output_path: PathBuf::from("models/robot_policy.onnx"),
            copy_to_public: true,
            public_path: PathBuf::from("../../public/models/robot_policy.onnx"),
            seed: None,
        }
    }
}

/// What the export stage produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    /// The written model
    pub summary: ExportSummary,
    /// Location of the public copy, if one was made
    pub public_copy: Option<PathBuf>,
}

/// Load the checkpoint, export its action path, then copy the model if asked
pub async fn export_policy(config: &ExportConfig) -> Result<ExportReport> {
    let checkpoint = Checkpoint::load(&config.model_path).await?;
    info!(
        model = %config.model_path.display(),
        env_id = %checkpoint.env_id,
        num_timesteps = checkpoint.num_timesteps,
        observation_shape = ?checkpoint.observation_space.shape(),
        action_shape = ?checkpoint.action_space.shape(),
        "loaded checkpoint"
    );

    let policy = InferencePolicy::from_policy(checkpoint.policy)?;
    let options = OnnxExportOptions {
        seed: config.seed,
        ..OnnxExportOptions::default()
    };
    let summary = export_onnx(&policy, &config.output_path, &options).await?;

    let public_copy = if config.copy_to_public {
        copy_artifact(&config.output_path, &config.public_path).await?;
        info!(path = %config.public_path.display(), "copied model to public directory");
        Some(config.public_path.clone())
    } else {
        None
    };

    Ok(ExportReport {
        summary,
        public_copy,
    })
}

/// Byte-for-byte copy of `src` to `dst`, creating missing directories
///
/// Fails with [`RLError::Export`] when both paths name the same file.
pub async fn copy_artifact(src: &Path, dst: &Path) -> Result<u64> {
    let source = fs::canonicalize(src)
        .await
        .with_context(|| format!("failed to resolve {}", src.display()))?;
    if fs::metadata(dst).await.is_ok() {
        let target = fs::canonicalize(dst)
            .await
            .with_context(|| format!("failed to resolve {}", dst.display()))?;
        if source == target {
            bail!(RLError::Export(format!(
                "refusing to copy {} onto itself",
                src.display()
            )));
        }
    }
    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .await
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use panda_rl_agent::{NetArch, Ppo, PpoConfig};
    use panda_rl_env::{make_vec_env, PANDA_REACH_V3};
    use panda_rl_onnx::{read_model, IR_VERSION, OPSET_VERSION};

    fn is_export_error(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|e| matches!(e.downcast_ref::<RLError>(), Some(RLError::Export(_))))
    }

    async fn saved_checkpoint(dir: &Path) -> PathBuf {
        let env = make_vec_env(PANDA_REACH_V3, 1, Some(9)).unwrap();
        let config = PpoConfig {
            net_arch: NetArch {
                pi: vec![16, 16],
                vf: vec![16, 16],
            },
            seed: Some(9),
            ..PpoConfig::default()
        };
        let model = Ppo::new(PANDA_REACH_V3, env, config).unwrap();
        let path = dir.join("models").join("ppo_panda_reach_final.zip");
        model.save(&path).await.unwrap();
        path
    }

    fn config_in(dir: &Path, model_path: PathBuf) -> ExportConfig {
        ExportConfig {
            model_path,
            output_path: dir.join("models").join("robot_policy.onnx"),
            public_path: dir.join("public").join("models").join("robot_policy.onnx"),
            seed: Some(1),
            ..ExportConfig::default()
        }
    }

    #[test]
    fn defaults_point_at_the_training_output() {
        let config = ExportConfig::default();
        assert_eq!(config.model_path, PathBuf::from("models/ppo_panda_reach_final.zip"));
        assert_eq!(config.output_path, PathBuf::from("models/robot_policy.onnx"));
        assert!(config.copy_to_public);
        assert_eq!(config.seed, None);
    }

    #[tokio::test]
    async fn copy_onto_itself_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("robot_policy.onnx");
        fs::write(&path, b"0123456789").await.unwrap();

        let err = copy_artifact(&path, &path).await.unwrap_err();
        assert!(is_export_error(&err));
        assert_eq!(fs::read(&path).await.unwrap(), b"0123456789");

        // A different spelling of the same file is caught too
        let aliased = dir.path().join(".").join("robot_policy.onnx");
        let err = copy_artifact(&path, &aliased).await.unwrap_err();
        assert!(is_export_error(&err));
        assert_eq!(fs::metadata(&path).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn public_path_equal_to_output_keeps_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = saved_checkpoint(dir.path()).await;
        let base = config_in(dir.path(), model_path);
        let config = ExportConfig {
            public_path: base.output_path.clone(),
            ..base
        };

        let err = export_policy(&config).await.unwrap_err();
        assert!(is_export_error(&err));
        let model = read_model(&config.output_path).await.unwrap();
        assert!(model.graph.is_some());
    }

    #[tokio::test]
    async fn missing_checkpoint_fails_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), dir.path().join("models").join("missing.zip"));
        let err = export_policy(&config).await.unwrap_err();

        assert!(format!("{err:#}").contains("missing.zip"));
        assert!(!config.output_path.exists());
        assert!(!config.public_path.exists());
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("broken.zip");
        fs::write(&model_path, b"not a checkpoint").await.unwrap();
        let config = config_in(dir.path(), model_path);

        let err = export_policy(&config).await.unwrap_err();
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<RLError>(),
            Some(RLError::Checkpoint(_))
        )));
        assert!(!config.output_path.exists());
    }

    #[tokio::test]
    async fn public_copy_creates_directories_and_matches() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = saved_checkpoint(dir.path()).await;
        let config = config_in(dir.path(), model_path);
        assert!(!dir.path().join("public").exists());

        let report = export_policy(&config).await.unwrap();
        assert_eq!(report.public_copy.as_deref(), Some(config.public_path.as_path()));
        let written = fs::read(&config.output_path).await.unwrap();
        let copied = fs::read(&config.public_path).await.unwrap();
        assert_eq!(written, copied);

        // Exporting again overwrites both in place
        export_policy(&config).await.unwrap();
        assert_eq!(fs::read(&config.public_path).await.unwrap(), written);
    }

    #[tokio::test]
    async fn copy_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = saved_checkpoint(dir.path()).await;
        let config = ExportConfig {
            copy_to_public: false,
            ..config_in(dir.path(), model_path)
        };
        let report = export_policy(&config).await.unwrap();
        assert!(report.public_copy.is_none());
        assert!(!config.public_path.exists());
    }

    #[tokio::test]
    async fn exported_shapes_come_from_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = saved_checkpoint(dir.path()).await;
        let config = ExportConfig {
            copy_to_public: false,
            ..config_in(dir.path(), model_path)
        };
        let report = export_policy(&config).await.unwrap();
        assert_eq!((report.summary.obs_dim, report.summary.act_dim), (12, 3));

        let model = read_model(&config.output_path).await.unwrap();
        assert_eq!(model.ir_version, IR_VERSION);
        assert_eq!(model.opset_import[0].version, OPSET_VERSION);
        assert_eq!(OPSET_VERSION, 11);
        let graph = model.graph.unwrap();
        assert_eq!(graph.input[0].name, "input");
        assert_eq!(graph.output[0].name, "output");
        assert!(graph.initializer.iter().all(|t| !t.name.contains("value")));
    }
}
