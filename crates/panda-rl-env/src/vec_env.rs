//! Sequential vectorized environment

use ndarray::{Array1, Array2, ArrayView1};
use tracing::trace;

use panda_rl_core::{BoxSpace, ContinuousAction, Environment, RLError, Result, StepInfo};

/// Batched result of stepping every sub-environment once
#[derive(Debug, Clone)]
pub struct VecStep {
    /// Next observations, `(n_envs, obs_dim)`; rows of finished envs are already reset
    pub observations: Array2<f32>,
    /// Rewards, `(n_envs,)`
    pub rewards: Array1<f32>,
    /// Whether the episode ended, by termination or truncation
    pub dones: Vec<bool>,
    /// Per-env step info
    pub infos: Vec<StepInfo>,
    /// Final observation of an episode that ended on this step
    pub terminal_observations: Vec<Option<Vec<f32>>>,
}

impl VecStep {
    /// Whether env `i` ended by its time limit rather than a terminal state
    #[must_use]
    pub fn is_timeout(&self, i: usize) -> bool {
        self.infos[i]
            .get_bool(StepInfo::TIME_LIMIT_TRUNCATED)
            .unwrap_or(false)
    }
}

/// Steps `n_envs` environments one after another and auto-resets finished ones
pub struct VecEnv {
    envs: Vec<Box<dyn Environment>>,
    observation_space: BoxSpace,
    action_space: BoxSpace,
}

impl VecEnv {
    /// Wrap a non-empty set of environments sharing the same spaces
    pub fn new(envs: Vec<Box<dyn Environment>>) -> Result<Self> {
        let first = envs
            .first()
            .ok_or_else(|| RLError::Config("VecEnv needs at least one environment".to_string()))?;
        let observation_space = first.observation_space();
        let action_space = first.action_space();
        if envs
            .iter()
            .any(|e| e.observation_space() != observation_space || e.action_space() != action_space)
        {
            return Err(RLError::Config(
                "all environments in a VecEnv must share their spaces".to_string(),
            ));
        }
        Ok(Self {
            envs,
            observation_space,
            action_space,
        })
    }

    /// Number of sub-environments
    #[must_use]
    pub fn num_envs(&self) -> usize {
        self.envs.len()
    }

    /// Shared observation space
    #[must_use]
    pub fn observation_space(&self) -> &BoxSpace {
        &self.observation_space
    }

    /// Shared action space
    #[must_use]
    pub fn action_space(&self) -> &BoxSpace {
        &self.action_space
    }

    /// Reseed env `i` with `seed + i`, wrapping at `u64::MAX`
    pub fn seed(&mut self, seed: u64) {
        for (i, env) in self.envs.iter_mut().enumerate() {
            env.seed(seed.wrapping_add(i as u64));
        }
    }

    /// Reset every environment
    pub async fn reset(&mut self) -> Result<Array2<f32>> {
        let obs_dim = self.observation_space.flat_dim();
        let mut observations = Array2::zeros((self.envs.len(), obs_dim));
        for (i, env) in self.envs.iter_mut().enumerate() {
            let (obs, _) = env.reset().await?;
            self.observation_space.check_dim(obs.data.len())?;
            observations
                .row_mut(i)
                .assign(&ArrayView1::from(obs.as_slice()));
        }
        Ok(observations)
    }

    /// Step every environment with its row of `actions`
    ///
    /// Actions are clipped into the action space first. An environment whose
    /// episode ends is reset immediately; its last observation moves to
    /// `terminal_observations` and the returned row holds the reset observation.
    pub async fn step(&mut self, actions: &Array2<f32>) -> Result<VecStep> {
        let n_envs = self.envs.len();
        let act_dim = self.action_space.flat_dim();
        if actions.nrows() != n_envs {
            return Err(RLError::DimensionMismatch {
                expected: n_envs,
                actual: actions.nrows(),
            });
        }
        if actions.ncols() != act_dim {
            return Err(RLError::DimensionMismatch {
                expected: act_dim,
                actual: actions.ncols(),
            });
        }

        let obs_dim = self.observation_space.flat_dim();
        let mut observations = Array2::zeros((n_envs, obs_dim));
        let mut rewards = Array1::zeros(n_envs);
        let mut dones = Vec::with_capacity(n_envs);
        let mut infos = Vec::with_capacity(n_envs);
        let mut terminal_observations = Vec::with_capacity(n_envs);

        for (i, env) in self.envs.iter_mut().enumerate() {
            let row: Vec<f32> = actions.row(i).to_vec();
            let action = ContinuousAction(self.action_space.clip(&row));
            let step = env.step(&action).await?;
            let done = step.done || step.truncated;

            rewards[i] = step.reward.0;
            let next_obs = if done {
                trace!(env = i, truncated = step.truncated, "episode finished, resetting");
                terminal_observations.push(Some(step.observation.data));
                env.reset().await?.0
            } else {
                terminal_observations.push(None);
                step.observation
            };
            observations
                .row_mut(i)
                .assign(&ArrayView1::from(next_obs.as_slice()));
            dones.push(done);
            infos.push(step.info);
        }

        Ok(VecStep {
            observations,
            rewards,
            dones,
            infos,
            terminal_observations,
        })
    }

    /// Close every environment
    pub async fn close(&mut self) -> Result<()> {
        for env in &mut self.envs {
            env.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{make_vec_env, PANDA_REACH_V3};

    #[tokio::test]
    async fn reset_stacks_one_row_per_env() {
        let mut venv = make_vec_env(PANDA_REACH_V3, 4, Some(0)).unwrap();
        let obs = venv.reset().await.unwrap();
        assert_eq!(obs.dim(), (4, 12));
        // Different seeds give different goals
        assert_ne!(obs.row(0).to_vec(), obs.row(1).to_vec());
    }

    #[tokio::test]
    async fn reseeding_near_u64_max_wraps() {
        let mut venv = make_vec_env(PANDA_REACH_V3, 3, None).unwrap();
        venv.seed(u64::MAX - 1);
        let obs = venv.reset().await.unwrap();

        let mut wrapped = make_vec_env(PANDA_REACH_V3, 1, Some(0)).unwrap();
        let expected = wrapped.reset().await.unwrap();
        assert_eq!(obs.row(2).to_vec(), expected.row(0).to_vec());
    }

    #[tokio::test]
    async fn step_rejects_wrong_action_shape() {
        let mut venv = make_vec_env(PANDA_REACH_V3, 2, Some(0)).unwrap();
        venv.reset().await.unwrap();
        let err = venv.step(&Array2::zeros((3, 3))).await.unwrap_err();
        assert!(matches!(err, RLError::DimensionMismatch { expected: 2, actual: 3 }));
        let err = venv.step(&Array2::zeros((2, 4))).await.unwrap_err();
        assert!(matches!(err, RLError::DimensionMismatch { expected: 3, actual: 4 }));
    }

    #[tokio::test]
    async fn finished_episodes_reset_and_report_summary() {
        let mut venv = make_vec_env(PANDA_REACH_V3, 2, Some(3)).unwrap();
        venv.reset().await.unwrap();
        let idle = Array2::zeros((2, 3));

        let mut finished = vec![false; 2];
        for _ in 0..50 {
            let step = venv.step(&idle).await.unwrap();
            for i in 0..2 {
                if step.dones[i] {
                    let terminal = step.terminal_observations[i].as_ref().unwrap();
                    assert_eq!(terminal.len(), 12);
                    let episode = step.infos[i].episode().expect("monitor summary");
                    assert!(episode.steps <= 50);
                    // Reset rows start back at the initial end-effector position
                    assert_eq!(step.observations[[i, 2]], 0.2);
                    finished[i] = true;
                } else {
                    assert!(step.terminal_observations[i].is_none());
                }
            }
        }
        assert!(finished.iter().all(|f| *f));
    }

    #[tokio::test]
    async fn out_of_range_actions_are_clipped() {
        let mut venv = make_vec_env(PANDA_REACH_V3, 1, Some(8)).unwrap();
        venv.reset().await.unwrap();
        let step = venv
            .step(&Array2::from_elem((1, 3), 5.0))
            .await
            .unwrap();
        if !step.dones[0] {
            assert!((step.observations[[0, 0]] - 0.05).abs() < 1e-6);
        }
    }
}
