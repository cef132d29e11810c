//! Environment traits and types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BoxSpace, ContinuousAction, Reward, VectorObservation};

/// Result of a single environment step
#[derive(Debug, Clone)]
pub struct Step {
    /// Observation from the environment
    pub observation: VectorObservation,
    /// Reward signal
    pub reward: Reward,
    /// Whether the episode reached a terminal state
    pub done: bool,
    /// Whether the episode was truncated (e.g., time limit)
    pub truncated: bool,
    /// Additional info from the environment
    pub info: StepInfo,
}

/// Additional information from a step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepInfo {
    /// Custom fields
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl StepInfo {
    /// Key set by goal-conditioned tasks when the goal is reached
    pub const IS_SUCCESS: &'static str = "is_success";
    /// Key holding the finished [`Episode`] summary
    pub const EPISODE: &'static str = "episode";
    /// Key set by the time-limit wrapper when it cut the episode short
    pub const TIME_LIMIT_TRUNCATED: &'static str = "TimeLimit.truncated";

    /// Insert or replace a field
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Read a boolean field
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(serde_json::Value::as_bool)
    }

    /// Whether the task reported success on this step
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.get_bool(Self::IS_SUCCESS).unwrap_or(false)
    }

    /// Episode summary attached when an episode finished on this step
    #[must_use]
    pub fn episode(&self) -> Option<Episode> {
        self.fields
            .get(Self::EPISODE)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Episode information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Total reward
    pub total_reward: f64,
    /// Number of steps
    pub steps: usize,
    /// Whether episode was truncated
    pub truncated: bool,
    /// Start time
    pub start_time: DateTime<Utc>,
    /// End time
    pub end_time: Option<DateTime<Utc>>,
}

/// Configuration for environments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Random seed
    pub seed: Option<u64>,
    /// Maximum episode steps
    pub max_steps: Option<usize>,
    /// Render mode
    pub render_mode: Option<String>,
    /// Additional parameters
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl EnvironmentConfig {
    /// Config with only a seed set
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }
}

/// Core environment trait
#[async_trait]
pub trait Environment: Send + Sync {
    /// Get the observation space
    fn observation_space(&self) -> BoxSpace;

    /// Get the action space
    fn action_space(&self) -> BoxSpace;

    /// Reseed the environment's random number generator
    fn seed(&mut self, seed: u64);

    /// Reset the environment
    async fn reset(&mut self) -> crate::Result<(VectorObservation, StepInfo)>;

    /// Take a step in the environment
    async fn step(&mut self, action: &ContinuousAction) -> crate::Result<Step>;

    /// Render the environment (optional)
    async fn render(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Close the environment
    async fn close(&mut self) -> crate::Result<()> {
        Ok(())
    }

    /// Get current episode info
    fn episode_info(&self) -> Option<Episode> {
        None
    }
}

#[async_trait]
impl<E> Environment for Box<E>
where
    E: Environment + ?Sized,
{
    fn observation_space(&self) -> BoxSpace {
        (**self).observation_space()
    }

    fn action_space(&self) -> BoxSpace {
        (**self).action_space()
    }

    fn seed(&mut self, seed: u64) {
        (**self).seed(seed);
    }

    async fn reset(&mut self) -> crate::Result<(VectorObservation, StepInfo)> {
        (**self).reset().await
    }

    async fn step(&mut self, action: &ContinuousAction) -> crate::Result<Step> {
        (**self).step(action).await
    }

    async fn render(&self) -> crate::Result<()> {
        (**self).render().await
    }

    async fn close(&mut self) -> crate::Result<()> {
        (**self).close().await
    }

    fn episode_info(&self) -> Option<Episode> {
        (**self).episode_info()
    }
}

/// Wrapper for environments that tracks episodes
///
/// When an episode ends the summary is attached to the step info under
/// [`StepInfo::EPISODE`], which is how the learner computes its rolling
/// reward and length statistics.
pub struct TrackedEnvironment<E> {
    /// Inner environment
    pub env: E,
    /// Current episode
    pub episode: Option<Episode>,
    /// Step counter
    pub step_count: usize,
}

impl<E> TrackedEnvironment<E> {
    /// Create a new tracked environment
    pub fn new(env: E) -> Self {
        Self {
            env,
            episode: None,
            step_count: 0,
        }
    }
}

#[async_trait]
impl<E> Environment for TrackedEnvironment<E>
where
    E: Environment,
{
    fn observation_space(&self) -> BoxSpace {
        self.env.observation_space()
    }

    fn action_space(&self) -> BoxSpace {
        self.env.action_space()
    }

    fn seed(&mut self, seed: u64) {
        self.env.seed(seed);
    }

    async fn reset(&mut self) -> crate::Result<(VectorObservation, StepInfo)> {
        self.episode = Some(Episode {
            total_reward: 0.0,
            steps: 0,
            truncated: false,
            start_time: Utc::now(),
            end_time: None,
        });
        self.step_count = 0;

        self.env.reset().await
    }

    async fn step(&mut self, action: &ContinuousAction) -> crate::Result<Step> {
        let mut step = self.env.step(action).await?;

        self.step_count += 1;
        if let Some(ref mut episode) = self.episode {
            episode.total_reward += f64::from(step.reward.0);
            episode.steps = self.step_count;

            if step.done || step.truncated {
                episode.truncated = step.truncated;
                episode.end_time = Some(Utc::now());
                step.info
                    .insert(StepInfo::EPISODE, serde_json::to_value(&*episode)?);
            }
        }

        Ok(step)
    }

    async fn render(&self) -> crate::Result<()> {
        self.env.render().await
    }

    async fn close(&mut self) -> crate::Result<()> {
        self.env.close().await
    }

    fn episode_info(&self) -> Option<Episode> {
        self.episode.clone()
    }
}
