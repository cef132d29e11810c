//! Training stage: PPO on the reach task, periodic checkpoints, a final
//! model and a short evaluation rollout.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use panda_rl_agent::utils::safe_mean;
use panda_rl_agent::{final_checkpoint_name, CheckpointCallback, Ppo, PpoConfig, ProgressLogger};
use panda_rl_core::{ContinuousAction, Environment, EnvironmentConfig, RLError};
use panda_rl_env::{make_vec_env_with, EnvRegistry, ReachConfig, PANDA_REACH_V3};

/// Prefix of the per-run log directories, `<log_dir>/PPO_<n>`
pub const LOG_RUN_PREFIX: &str = "PPO";

/// Everything the training stage needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Registered environment id
    pub env_id: String,
    /// Environments stepped together
    pub n_envs: usize,
    /// Environment steps to train for, across all environments
    pub total_timesteps: u64,
    /// Steps between periodic checkpoints
    pub save_freq: u64,
    /// Root of the per-run progress logs
    pub log_dir: PathBuf,
    /// Destination of checkpoints and the final model
    pub models_dir: PathBuf,
    /// Checkpoint file name prefix
    pub name_prefix: String,
    /// Steps run after training
    pub eval_steps: usize,
    /// Use the mean action during evaluation instead of sampling
    pub eval_deterministic: bool,
    /// Seed for environments and learner; overrides `ppo.seed`
    pub seed: Option<u64>,
    /// Task parameters
    pub reach: ReachConfig,
    /// Learner hyperparameters
    pub ppo: PpoConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            env_id: PANDA_REACH_V3.to_string(),
            n_envs: 4,
            total_timesteps: 100_000,
            save_freq: 10_000,
            log_dir: PathBuf::from("./logs/"),
            models_dir: PathBuf::from("./models/"),
            name_prefix: "ppo_panda_reach".to_string(),
            eval_steps: 100,
            eval_deterministic: false,
            seed: None,
            reach: ReachConfig::default(),
            ppo: PpoConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Read a JSON config; missing fields take their defaults
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(RLError::from)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Reject configurations training cannot run with
    pub fn validate(&self, registry: &EnvRegistry) -> Result<()> {
        if !registry.contains(&self.env_id) {
            bail!(RLError::UnknownEnvironment(self.env_id.clone()));
        }
        if self.n_envs == 0 || self.save_freq == 0 || self.total_timesteps == 0 {
            bail!(RLError::Config(
                "n_envs, save_freq and total_timesteps must be at least 1".to_string()
            ));
        }
        if self.name_prefix.is_empty() {
            bail!(RLError::Config("name_prefix must not be empty".to_string()));
        }
        self.reach.validate()?;
        self.ppo.validate()
    }

    fn ppo_config(&self) -> PpoConfig {
        PpoConfig {
            seed: self.seed.or(self.ppo.seed),
            ..self.ppo.clone()
        }
    }
}

/// Outcome of the post-training evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvalReport {
    /// Steps taken
    pub steps: usize,
    /// Episodes that ended, by success or time limit
    pub episodes: usize,
    /// Episodes that ended at the goal
    pub successes: usize,
    /// Reward summed over every step
    pub total_reward: f64,
    /// Mean return of the finished episodes
    pub mean_episode_return: Option<f64>,
}

/// Artifacts and statistics of a training run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainReport {
    /// Progress log directory of this run
    pub run_dir: PathBuf,
    /// Periodic checkpoints, oldest first
    pub checkpoints: Vec<PathBuf>,
    /// Final model
    pub final_model: PathBuf,
    /// Environment steps taken
    pub num_timesteps: u64,
    /// Post-training evaluation
    pub eval: EvalReport,
}

/// Train, checkpoint, save the final model and evaluate it
pub async fn run_training(config: &TrainConfig) -> Result<TrainReport> {
    let registry = EnvRegistry::with_defaults();
    config.validate(&registry)?;

    let env = make_vec_env_with(
        &registry,
        &config.env_id,
        config.n_envs,
        config.seed,
        &config.reach,
    )?;
    let mut model = Ppo::new(config.env_id.clone(), env, config.ppo_config())?;

    let logger = ProgressLogger::create(&config.log_dir, LOG_RUN_PREFIX).await?;
    let run_dir = logger.run_dir().to_path_buf();
    model.set_logger(logger);

    let mut checkpoints =
        CheckpointCallback::new(config.save_freq, &config.models_dir, config.name_prefix.clone())?;
    model.learn(config.total_timesteps, &mut checkpoints).await?;

    let final_model = config.models_dir.join(final_checkpoint_name(&config.name_prefix));
    model.save(&final_model).await?;

    let mut eval_env = registry.make(&config.env_id, eval_env_config(config)?)?;
    let eval = evaluate(
        &mut model,
        eval_env.as_mut(),
        config.eval_steps,
        config.eval_deterministic,
    )
    .await;
    eval_env.close().await?;
    model.close_env().await?;
    let eval = eval?;

    info!(
        num_timesteps = model.num_timesteps(),
        checkpoints = checkpoints.saved().len(),
        final_model = %final_model.display(),
        eval_episodes = eval.episodes,
        eval_successes = eval.successes,
        eval_reward = eval.total_reward,
        "training complete"
    );
    Ok(TrainReport {
        run_dir,
        checkpoints: checkpoints.saved().to_vec(),
        final_model,
        num_timesteps: model.num_timesteps(),
        eval,
    })
}

/// Seeded past the training copies so evaluation goals differ from theirs
fn eval_env_config(config: &TrainConfig) -> Result<EnvironmentConfig> {
    let params = match serde_json::to_value(&config.reach).map_err(RLError::from)? {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Ok(EnvironmentConfig {
        seed: config.seed.map(|s| s.wrapping_add(config.n_envs as u64)),
        params,
        ..EnvironmentConfig::default()
    })
}

/// Run `steps` policy steps, resetting whenever an episode ends
///
/// Actions are sampled from the policy unless `deterministic` is set.
pub async fn evaluate(
    model: &mut Ppo,
    env: &mut dyn Environment,
    steps: usize,
    deterministic: bool,
) -> Result<EvalReport> {
    let mut report = EvalReport {
        steps,
        ..EvalReport::default()
    };
    let mut returns = Vec::new();
    let mut episode_return = 0.0f64;

    let (mut obs, _) = env.reset().await?;
    for _ in 0..steps {
        let action = model.predict_one(obs.as_slice(), deterministic)?;
        let step = env.step(&ContinuousAction(action)).await?;
        let reward = f64::from(step.reward.value());
        report.total_reward += reward;
        episode_return += reward;

        if step.done || step.truncated {
            report.episodes += 1;
            if step.info.is_success() {
                report.successes += 1;
            }
            returns.push(episode_return);
            episode_return = 0.0;
            obs = env.reset().await?.0;
        } else {
            obs = step.observation;
        }
    }
    report.mean_episode_return = safe_mean(returns);
    Ok(report)
}
