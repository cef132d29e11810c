//! Environment wrappers

use async_trait::async_trait;

use panda_rl_core::{
    BoxSpace, ContinuousAction, Environment, Episode, Result, Step, StepInfo, VectorObservation,
};

/// Time limit wrapper
///
/// Cuts an episode after `max_steps` steps. A cut episode is reported with
/// `truncated = true` and `done` left as the inner environment set it, so a
/// learner can tell timeouts apart from real terminal states. The info also
/// carries [`StepInfo::TIME_LIMIT_TRUNCATED`].
pub struct TimeLimit<E> {
    /// Inner environment
    pub env: E,
    /// Maximum steps
    pub max_steps: usize,
    /// Current step count
    pub steps: usize,
}

impl<E> TimeLimit<E> {
    /// Create a new time limit wrapper
    pub fn new(env: E, max_steps: usize) -> Self {
        Self {
            env,
            max_steps,
            steps: 0,
        }
    }
}

#[async_trait]
impl<E> Environment for TimeLimit<E>
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

    async fn reset(&mut self) -> Result<(VectorObservation, StepInfo)> {
        self.steps = 0;
        self.env.reset().await
    }

    async fn step(&mut self, action: &ContinuousAction) -> Result<Step> {
        self.steps += 1;
        let mut step = self.env.step(action).await?;

        if self.steps >= self.max_steps {
            let cut = !step.done;
            step.truncated = step.truncated || cut;
            step.info.insert(StepInfo::TIME_LIMIT_TRUNCATED, cut);
        }

        Ok(step)
    }

    async fn render(&self) -> Result<()> {
        self.env.render().await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }

    fn episode_info(&self) -> Option<Episode> {
        self.env.episode_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PandaReachEnv, ReachConfig};

    #[tokio::test]
    async fn truncates_after_max_steps() {
        // A micrometer threshold keeps an idle arm from ever reaching the goal
        let config = ReachConfig {
            distance_threshold: 1e-6,
            ..ReachConfig::default()
        };
        let inner = PandaReachEnv::with_config(config, Some(4)).unwrap();
        let mut env = TimeLimit::new(inner, 5);
        env.reset().await.unwrap();

        let idle = ContinuousAction(vec![0.0, 0.0, 0.0]);
        for _ in 1..5 {
            let step = env.step(&idle).await.unwrap();
            assert!(!step.done);
            assert!(!step.truncated);
            assert_ne!(step.info.get_bool(StepInfo::TIME_LIMIT_TRUNCATED), Some(true));
        }
        let last = env.step(&idle).await.unwrap();
        assert!(!last.done);
        assert!(last.truncated);
        assert_eq!(last.info.get_bool(StepInfo::TIME_LIMIT_TRUNCATED), Some(true));
    }

    #[tokio::test]
    async fn reset_restarts_the_counter() {
        let inner = PandaReachEnv::with_config(ReachConfig::default(), Some(4)).unwrap();
        let mut env = TimeLimit::new(inner, 3);
        env.reset().await.unwrap();
        let idle = ContinuousAction(vec![0.0; 3]);
        env.step(&idle).await.unwrap();
        env.step(&idle).await.unwrap();
        env.reset().await.unwrap();
        assert_eq!(env.steps, 0);
        let step = env.step(&idle).await.unwrap();
        assert!(!step.truncated);
    }
}
