//! Proximal Policy Optimization
//!
//! Clipped-surrogate PPO with GAE over a vectorized environment. Rollouts of
//! `n_steps` per environment are collected, then the policy is optimized for
//! `n_epochs` passes of shuffled minibatches with Adam.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use ndarray::{Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use panda_rl_core::{BoxSpace, Episode, RLError, StepInfo};
use panda_rl_env::{VecEnv, VecStep};

use crate::buffer::{RolloutBatch, RolloutBuffer};
use crate::callbacks::Callback;
use crate::checkpoint::{Checkpoint, ALGORITHM, CHECKPOINT_FORMAT_VERSION};
use crate::logger::{log_record, ProgressLogger, ProgressRecord};
use crate::optim::{clip_grad_norm, Adam};
use crate::policy::{gaussian_entropy, ActorCriticPolicy, NetArch};
use crate::utils::{explained_variance, safe_mean};

/// Episodes kept for the rolling reward, length and success statistics
const EP_INFO_BUFFER_LEN: usize = 100;

/// PPO hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    /// Adam step size
    pub learning_rate: f32,
    /// Steps collected per environment between updates
    pub n_steps: usize,
    /// Minibatch size
    pub batch_size: usize,
    /// Optimization passes over each rollout
    pub n_epochs: usize,
    /// Discount factor
    pub gamma: f32,
    /// GAE smoothing factor
    pub gae_lambda: f32,
    /// Surrogate clipping range
    pub clip_range: f32,
    /// Normalize advantages per minibatch
    pub normalize_advantage: bool,
    /// Entropy bonus weight
    pub ent_coef: f32,
    /// Value loss weight
    pub vf_coef: f32,
    /// Global gradient norm limit
    pub max_grad_norm: f32,
    /// Stop an update early once the approximate KL exceeds `1.5 × target_kl`
    pub target_kl: Option<f32>,
    /// Initial log standard deviation of the action distribution
    pub log_std_init: f32,
    /// Extractor layer widths
    pub net_arch: NetArch,
    /// Adam epsilon
    pub adam_eps: f32,
    /// Seed for parameter initialization, sampling and shuffling
    pub seed: Option<u64>,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            n_steps: 2048,
            batch_size: 64,
            n_epochs: 10,
            gamma: 0.99,
            gae_lambda: 0.95,
            clip_range: 0.2,
            normalize_advantage: true,
            ent_coef: 0.0,
            vf_coef: 0.5,
            max_grad_norm: 0.5,
            target_kl: None,
            log_std_init: 0.0,
            net_arch: NetArch::default(),
            adam_eps: 1e-5,
            seed: None,
        }
    }
}

impl PpoConfig {
    /// Reject hyperparameters PPO cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| -> Result<()> { Err(RLError::Config(msg.to_string()).into()) };
        if self.n_steps == 0 || self.n_epochs == 0 {
            return fail("n_steps and n_epochs must be at least 1");
        }
        if self.batch_size == 0 || (self.normalize_advantage && self.batch_size < 2) {
            return fail("batch_size must be > 1 when advantages are normalized");
        }
        if self.learning_rate <= 0.0 || self.clip_range <= 0.0 {
            return fail("learning_rate and clip_range must be positive");
        }
        if !(0.0..=1.0).contains(&self.gamma) || !(0.0..=1.0).contains(&self.gae_lambda) {
            return fail("gamma and gae_lambda must lie in [0, 1]");
        }
        if self.max_grad_norm <= 0.0 || self.vf_coef < 0.0 || self.ent_coef < 0.0 {
            return fail("max_grad_norm must be positive, vf_coef and ent_coef non-negative");
        }
        if self.net_arch.pi.contains(&0) || self.net_arch.vf.contains(&0) {
            return fail("net_arch layers must have at least one unit");
        }
        Ok(())
    }
}

/// Scalars produced by one evaluation of the PPO loss
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossInfo {
    /// Clipped surrogate loss
    pub policy_gradient_loss: f32,
    /// Value regression loss
    pub value_loss: f32,
    /// Negative entropy
    pub entropy_loss: f32,
    /// Weighted total
    pub loss: f32,
    /// `mean((r - 1) - log r)`
    pub approx_kl: f32,
    /// Fraction of ratios outside the clip range
    pub clip_fraction: f32,
}

/// Averages over one call to [`Ppo::train`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainStats {
    /// Mean losses and diagnostics across minibatches
    pub mean: LossInfo,
    /// Total loss of the last minibatch
    pub last_loss: f32,
    /// Explained variance of the rollout value estimates
    pub explained_variance: f32,
    /// Minibatch updates applied
    pub gradient_steps: usize,
}

/// PPO loss of `batch` under `policy` and its gradient w.r.t. every parameter
#[allow(clippy::cast_precision_loss)]
pub fn ppo_loss(
    policy: &ActorCriticPolicy,
    batch: &RolloutBatch,
    config: &PpoConfig,
) -> Result<(LossInfo, ActorCriticPolicy)> {
    let b = batch.len();
    if b == 0 {
        bail!("empty minibatch");
    }
    let bf = b as f32;
    let (log_prob, cache) =
        policy.evaluate_actions(&batch.observations.view(), &batch.actions.view())?;

    let mut adv = batch.advantages.clone();
    if config.normalize_advantage && b > 1 {
        let mean = adv.mean().unwrap_or(0.0);
        let std = adv.std(1.0);
        adv.mapv_inplace(|a| (a - mean) / (std + 1e-8));
    }

    let log_ratio = &log_prob - &batch.old_log_probs;
    let ratio = log_ratio.mapv(f32::exp);
    let clip = config.clip_range;

    let mut pg_loss = 0.0;
    let mut clipped = 0usize;
    let mut grad_logp = Array1::<f32>::zeros(b);
    for i in 0..b {
        let surr1 = adv[i] * ratio[i];
        let surr2 = adv[i] * ratio[i].clamp(1.0 - clip, 1.0 + clip);
        if surr1 <= surr2 {
            pg_loss -= surr1;
            grad_logp[i] = -adv[i] * ratio[i] / bf;
        } else {
            pg_loss -= surr2;
        }
        if (ratio[i] - 1.0).abs() > clip {
            clipped += 1;
        }
    }
    pg_loss /= bf;

    let value_err = &cache.values - &batch.returns;
    let value_loss = value_err.mapv(|e| e * e).sum() / bf;
    let grad_values = value_err.mapv(|e| config.vf_coef * 2.0 * e / bf);

    let entropy_loss = -gaussian_entropy(&policy.log_std.view());
    let loss = pg_loss + config.ent_coef * entropy_loss + config.vf_coef * value_loss;

    // d log N(a; μ, σ) / dμ = (a - μ) / σ², / d log σ = (a - μ)² / σ² - 1
    let var = policy.log_std.mapv(|ls| (2.0 * ls).exp());
    let diff = &batch.actions - &cache.mean;
    let grad_mean = &diff / &var * &grad_logp.view().insert_axis(ndarray::Axis(1));
    let mut grad_log_std = Array1::<f32>::from_elem(policy.act_dim(), -config.ent_coef);
    for (i, row) in diff.rows().into_iter().enumerate() {
        for (j, d) in row.iter().enumerate() {
            grad_log_std[j] += grad_logp[i] * (d * d / var[j] - 1.0);
        }
    }

    let approx_kl = ((&ratio - 1.0) - &log_ratio).sum() / bf;
    let grads = policy.backward(&cache, &grad_mean, &grad_values, grad_log_std);

    Ok((
        LossInfo {
            policy_gradient_loss: pg_loss,
            value_loss,
            entropy_loss,
            loss,
            approx_kl,
            clip_fraction: clipped as f32 / bf,
        },
        grads,
    ))
}

/// PPO learner bound to a vectorized environment
pub struct Ppo {
    config: PpoConfig,
    env_id: String,
    observation_space: BoxSpace,
    action_space: BoxSpace,
    policy: ActorCriticPolicy,
    optimizer: Adam,
    num_timesteps: u64,
    n_updates: u64,
    rng: StdRng,
    env: Option<VecEnv>,
    last_obs: Option<Array2<f32>>,
    last_episode_starts: Vec<bool>,
    ep_info_buffer: VecDeque<Episode>,
    ep_success_buffer: VecDeque<bool>,
    logger: Option<ProgressLogger>,
}

impl Ppo {
    /// Fresh learner for `env`, which was created from `env_id`
    pub fn new(env_id: impl Into<String>, mut env: VecEnv, config: PpoConfig) -> Result<Self> {
        config.validate()?;
        let observation_space = env.observation_space().clone();
        let action_space = env.action_space().clone();
        if observation_space.shape().len() != 1 || action_space.shape().len() != 1 {
            bail!(RLError::Config(format!(
                "PPO needs flat spaces, got observation shape {:?} and action shape {:?}",
                observation_space.shape(),
                action_space.shape()
            )));
        }

        let mut rng = match config.seed {
            Some(seed) => {
                env.seed(seed);
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_entropy(),
        };
        let policy = ActorCriticPolicy::new(
            observation_space.flat_dim(),
            action_space.flat_dim(),
            &config.net_arch,
            config.log_std_init,
            &mut rng,
        );
        let optimizer = Adam::new(policy.num_parameters(), config.learning_rate, config.adam_eps);

        let env_id = env_id.into();
        info!(
            env_id = %env_id,
            n_envs = env.num_envs(),
            obs_dim = observation_space.flat_dim(),
            act_dim = action_space.flat_dim(),
            parameters = policy.num_parameters(),
            "created PPO model"
        );

        Ok(Self {
            config,
            env_id,
            observation_space,
            action_space,
            policy,
            optimizer,
            num_timesteps: 0,
            n_updates: 0,
            rng,
            env: Some(env),
            last_obs: None,
            last_episode_starts: Vec::new(),
            ep_info_buffer: VecDeque::with_capacity(EP_INFO_BUFFER_LEN),
            ep_success_buffer: VecDeque::with_capacity(EP_INFO_BUFFER_LEN),
            logger: None,
        })
    }

    /// Hyperparameters
    #[must_use]
    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    /// Environment id the model is trained on
    #[must_use]
    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    /// Current policy
    #[must_use]
    pub fn policy(&self) -> &ActorCriticPolicy {
        &self.policy
    }

    /// Declared observation space
    #[must_use]
    pub fn observation_space(&self) -> &BoxSpace {
        &self.observation_space
    }

    /// Declared action space
    #[must_use]
    pub fn action_space(&self) -> &BoxSpace {
        &self.action_space
    }

    /// Environment steps taken, across all environments
    #[must_use]
    pub fn num_timesteps(&self) -> u64 {
        self.num_timesteps
    }

    /// Gradient epochs run
    #[must_use]
    pub fn n_updates(&self) -> u64 {
        self.n_updates
    }

    /// Summaries of the most recent finished episodes
    pub fn episode_infos(&self) -> impl Iterator<Item = &Episode> {
        self.ep_info_buffer.iter()
    }

    /// Send progress records to `logger` in addition to tracing
    pub fn set_logger(&mut self, logger: ProgressLogger) {
        self.logger = Some(logger);
    }

    /// Attach an environment with matching spaces, replacing any current one
    pub fn set_env(&mut self, env: VecEnv) -> Result<()> {
        if env.observation_space() != &self.observation_space || env.action_space() != &self.action_space {
            bail!(RLError::Config(
                "environment spaces do not match the model".to_string()
            ));
        }
        self.env = Some(env);
        self.last_obs = None;
        Ok(())
    }

    /// Close the attached environment, if any
    pub async fn close_env(&mut self) -> Result<()> {
        if let Some(env) = self.env.as_mut() {
            env.close().await?;
        }
        Ok(())
    }

    /// Actions for a batch of observations, clipped into the action space
    pub fn predict(&mut self, obs: &ArrayView2<f32>, deterministic: bool) -> Result<Array2<f32>> {
        let mut actions = if deterministic {
            self.policy.action_mean(obs)?
        } else {
            self.policy.sample(obs, &mut self.rng)?.0
        };
        for mut row in actions.rows_mut() {
            for ((a, lo), hi) in row
                .iter_mut()
                .zip(&self.action_space.low)
                .zip(&self.action_space.high)
            {
                *a = a.clamp(*lo, *hi);
            }
        }
        Ok(actions)
    }

    /// Action for a single observation
    pub fn predict_one(&mut self, obs: &[f32], deterministic: bool) -> Result<Vec<f32>> {
        let obs = ArrayView2::from_shape((1, obs.len()), obs)?;
        Ok(self.predict(&obs, deterministic)?.row(0).to_vec())
    }

    /// Train until at least `total_timesteps` environment steps have been taken
    ///
    /// The step count carries over between calls; training stops at the first
    /// rollout boundary at or past the budget, or when `callback` asks to stop.
    pub async fn learn(&mut self, total_timesteps: u64, callback: &mut dyn Callback) -> Result<()> {
        let mut env = self.env.take().ok_or_else(|| {
            anyhow!(RLError::Config(
                "model has no environment, attach one with set_env".to_string()
            ))
        })?;
        let result = self.learn_with(&mut env, total_timesteps, callback).await;
        self.env = Some(env);
        result
    }

    #[allow(clippy::cast_precision_loss)]
    async fn learn_with(
        &mut self,
        env: &mut VecEnv,
        total_timesteps: u64,
        callback: &mut dyn Callback,
    ) -> Result<()> {
        let n_envs = env.num_envs();
        if self.last_obs.is_none() {
            self.last_obs = Some(env.reset().await?);
            self.last_episode_starts = vec![true; n_envs];
        }

        let mut buffer = RolloutBuffer::new(
            self.config.n_steps,
            n_envs,
            self.observation_space.flat_dim(),
            self.action_space.flat_dim(),
            self.config.gamma,
            self.config.gae_lambda,
        );

        info!(
            env_id = %self.env_id,
            total_timesteps,
            rollout_size = self.config.n_steps * n_envs,
            "starting training"
        );
        callback.on_training_start(self).await?;

        let start = Instant::now();
        let start_timesteps = self.num_timesteps;
        let mut iteration = 0u64;
        while self.num_timesteps < total_timesteps {
            if !self.collect_rollouts(env, &mut buffer, callback).await? {
                info!(num_timesteps = self.num_timesteps, "training stopped by callback");
                break;
            }
            iteration += 1;
            let stats = self.train(&buffer)?;

            let elapsed = start.elapsed().as_secs_f64();
            let record = ProgressRecord {
                iterations: iteration,
                total_timesteps: self.num_timesteps,
                time_elapsed: elapsed,
                fps: (self.num_timesteps - start_timesteps) as f64 / elapsed.max(1e-9),
                ep_rew_mean: safe_mean(self.ep_info_buffer.iter().map(|e| e.total_reward)),
                ep_len_mean: safe_mean(self.ep_info_buffer.iter().map(|e| e.steps as f64)),
                success_rate: safe_mean(
                    self.ep_success_buffer
                        .iter()
                        .map(|s| if *s { 1.0f64 } else { 0.0 }),
                ),
                policy_gradient_loss: stats.mean.policy_gradient_loss,
                value_loss: stats.mean.value_loss,
                entropy_loss: stats.mean.entropy_loss,
                approx_kl: stats.mean.approx_kl,
                clip_fraction: stats.mean.clip_fraction,
                explained_variance: stats.explained_variance,
                std: self.policy.log_std.mapv(f32::exp).mean().unwrap_or(0.0),
                loss: stats.last_loss,
                n_updates: self.n_updates,
                learning_rate: self.optimizer.lr,
            };
            match &self.logger {
                Some(logger) => logger.record(&record).await?,
                None => log_record(&record),
            }
        }

        callback.on_training_end(self).await?;
        info!(num_timesteps = self.num_timesteps, "training finished");
        Ok(())
    }

    /// Fill `buffer` with `n_steps` vectorized steps; `false` if the callback stopped training
    async fn collect_rollouts(
        &mut self,
        env: &mut VecEnv,
        buffer: &mut RolloutBuffer,
        callback: &mut dyn Callback,
    ) -> Result<bool> {
        buffer.reset();
        let n_envs = env.num_envs();

        while !buffer.is_full() {
            let obs = self
                .last_obs
                .take()
                .ok_or_else(|| anyhow!("rollout collection started without an observation"))?;
            let (actions, values, log_probs) = self.policy.sample(&obs.view(), &mut self.rng)?;
            let step = env.step(&actions).await?;
            self.num_timesteps += n_envs as u64;

            let rewards = self.bootstrap_timeouts(&step)?;
            self.update_info_buffer(&step);
            buffer.add(
                &obs.view(),
                &actions.view(),
                &rewards.view(),
                &self.last_episode_starts,
                &values.view(),
                &log_probs.view(),
            )?;
            self.last_obs = Some(step.observations);
            self.last_episode_starts = step.dones;

            if !callback.on_step(self).await? {
                return Ok(false);
            }
        }

        let last_obs = self
            .last_obs
            .as_ref()
            .ok_or_else(|| anyhow!("rollout ended without an observation"))?;
        let last_values = self.policy.predict_values(&last_obs.view())?;
        buffer.compute_returns_and_advantage(&last_values.view(), &self.last_episode_starts)?;
        Ok(true)
    }

    /// Rewards with `γ·V(terminal)` added for episodes cut by a time limit
    fn bootstrap_timeouts(&self, step: &VecStep) -> Result<Array1<f32>> {
        let mut rewards = step.rewards.clone();
        for (i, terminal) in step.terminal_observations.iter().enumerate() {
            let Some(terminal) = terminal else { continue };
            if step.dones[i] && step.is_timeout(i) {
                let terminal = ArrayView2::from_shape((1, terminal.len()), terminal.as_slice())?;
                let value = self.policy.predict_values(&terminal)?[0];
                rewards[i] += self.config.gamma * value;
            }
        }
        Ok(rewards)
    }

    fn update_info_buffer(&mut self, step: &VecStep) {
        for (info, done) in step.infos.iter().zip(&step.dones) {
            if !done {
                continue;
            }
            if let Some(episode) = info.episode() {
                if self.ep_info_buffer.len() == EP_INFO_BUFFER_LEN {
                    self.ep_info_buffer.pop_front();
                }
                self.ep_info_buffer.push_back(episode);
            }
            if let Some(success) = info.get_bool(StepInfo::IS_SUCCESS) {
                if self.ep_success_buffer.len() == EP_INFO_BUFFER_LEN {
                    self.ep_success_buffer.pop_front();
                }
                self.ep_success_buffer.push_back(success);
            }
        }
    }

    /// Optimize the policy on a full rollout buffer
    #[allow(clippy::cast_precision_loss)]
    pub fn train(&mut self, buffer: &RolloutBuffer) -> Result<TrainStats> {
        self.optimizer.lr = self.config.learning_rate;

        let mut sum = LossInfo::default();
        let mut count = 0usize;
        let mut last_loss = 0.0;
        let mut continue_training = true;

        for epoch in 0..self.config.n_epochs {
            let batches = buffer.minibatches(self.config.batch_size, &mut self.rng);
            for batch in &batches {
                let (info, grads) = ppo_loss(&self.policy, batch, &self.config)?;
                sum.policy_gradient_loss += info.policy_gradient_loss;
                sum.value_loss += info.value_loss;
                sum.entropy_loss += info.entropy_loss;
                sum.approx_kl += info.approx_kl;
                sum.clip_fraction += info.clip_fraction;
                count += 1;
                last_loss = info.loss;

                if let Some(target_kl) = self.config.target_kl {
                    if info.approx_kl > 1.5 * target_kl {
                        debug!(epoch, approx_kl = info.approx_kl, "early stopping at target KL");
                        continue_training = false;
                        break;
                    }
                }

                let mut flat_grads = grads.parameters();
                clip_grad_norm(&mut flat_grads, self.config.max_grad_norm);
                let mut params = self.policy.parameters();
                self.optimizer.step(&mut params, &flat_grads)?;
                self.policy.set_parameters(&params)?;
            }
            self.n_updates += 1;
            if !continue_training {
                break;
            }
        }

        let n = count.max(1) as f32;
        let mean = LossInfo {
            policy_gradient_loss: sum.policy_gradient_loss / n,
            value_loss: sum.value_loss / n,
            entropy_loss: sum.entropy_loss / n,
            loss: last_loss,
            approx_kl: sum.approx_kl / n,
            clip_fraction: sum.clip_fraction / n,
        };
        Ok(TrainStats {
            mean,
            last_loss,
            explained_variance: explained_variance(&buffer.values(), &buffer.returns()),
            gradient_steps: count,
        })
    }

    /// Snapshot of the full trainable state
    #[must_use]
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            algorithm: ALGORITHM.to_string(),
            env_id: self.env_id.clone(),
            created_at: chrono::Utc::now(),
            num_timesteps: self.num_timesteps,
            n_updates: self.n_updates,
            config: self.config.clone(),
            observation_space: self.observation_space.clone(),
            action_space: self.action_space.clone(),
            policy: self.policy.clone(),
            optimizer: self.optimizer.clone(),
        }
    }

    /// Rebuild a learner from a checkpoint, optionally attaching an environment
    pub fn from_checkpoint(checkpoint: Checkpoint, env: Option<VecEnv>) -> Result<Self> {
        let rng = match checkpoint.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(checkpoint.num_timesteps)),
            None => StdRng::from_entropy(),
        };
        let mut model = Self {
            config: checkpoint.config,
            env_id: checkpoint.env_id,
            observation_space: checkpoint.observation_space,
            action_space: checkpoint.action_space,
            policy: checkpoint.policy,
            optimizer: checkpoint.optimizer,
            num_timesteps: checkpoint.num_timesteps,
            n_updates: checkpoint.n_updates,
            rng,
            env: None,
            last_obs: None,
            last_episode_starts: Vec::new(),
            ep_info_buffer: VecDeque::with_capacity(EP_INFO_BUFFER_LEN),
            ep_success_buffer: VecDeque::with_capacity(EP_INFO_BUFFER_LEN),
            logger: None,
        };
        if let Some(env) = env {
            model.set_env(env)?;
        }
        Ok(model)
    }

    /// Write a checkpoint of the current state
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.to_checkpoint().save(path).await
    }

    /// Load a learner from a checkpoint file
    pub async fn load(path: impl AsRef<Path>, env: Option<VecEnv>) -> Result<Self> {
        Self::from_checkpoint(Checkpoint::load(path).await?, env)
    }
}
