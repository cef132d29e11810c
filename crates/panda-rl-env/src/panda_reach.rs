//! Panda reaching task
//!
//! A kinematic model of the Franka Panda end effector: the action is a
//! Cartesian displacement command, the end effector follows it inside the
//! reachable workspace, and the episode succeeds once the end effector is
//! within `distance_threshold` of a goal sampled at reset.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use panda_rl_core::{
    BoxSpace, ContinuousAction, Environment, EnvironmentConfig, RLError, Result, RewardType, Step,
    StepInfo, VectorObservation,
};

/// Width of the flattened observation: position, velocity, achieved goal, desired goal
pub const OBSERVATION_DIM: usize = 12;
/// Cartesian displacement command
pub const ACTION_DIM: usize = 3;

/// Reach task parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachConfig {
    /// Reward shape
    pub reward_type: RewardType,
    /// Success radius around the goal, in meters
    pub distance_threshold: f32,
    /// Edge length of the goal sampling box, in meters
    pub goal_range: f32,
    /// Displacement produced by a unit action, in meters
    pub action_scale: f32,
    /// Simulated seconds per step
    pub time_step: f32,
    /// End-effector position after reset
    pub initial_ee_position: [f32; 3],
    /// Lower corner of the reachable workspace
    pub workspace_low: [f32; 3],
    /// Upper corner of the reachable workspace
    pub workspace_high: [f32; 3],
    /// Symmetric bound of the observation box
    pub observation_bound: f32,
}

impl Default for ReachConfig {
    fn default() -> Self {
        Self {
            reward_type: RewardType::Sparse,
            distance_threshold: 0.05,
            goal_range: 0.3,
            action_scale: 0.05,
            time_step: 0.04,
            initial_ee_position: [0.0, 0.0, 0.2],
            workspace_low: [-0.5, -0.5, 0.0],
            workspace_high: [0.5, 0.5, 0.6],
            observation_bound: 10.0,
        }
    }
}

impl ReachConfig {
    /// Check that every parameter is physically meaningful
    pub fn validate(&self) -> Result<()> {
        if self.distance_threshold <= 0.0 {
            return Err(RLError::Config("distance_threshold must be > 0".to_string()));
        }
        if self.goal_range < 0.0 {
            return Err(RLError::Config("goal_range must be >= 0".to_string()));
        }
        if self.action_scale <= 0.0 || self.time_step <= 0.0 {
            return Err(RLError::Config(
                "action_scale and time_step must be > 0".to_string(),
            ));
        }
        if self
            .workspace_low
            .iter()
            .zip(&self.workspace_high)
            .any(|(l, h)| l >= h)
        {
            return Err(RLError::Config("workspace_low must be below workspace_high".to_string()));
        }
        Ok(())
    }

    fn goal_low(&self) -> [f32; 3] {
        [-self.goal_range / 2.0, -self.goal_range / 2.0, 0.0]
    }

    fn goal_high(&self) -> [f32; 3] {
        [self.goal_range / 2.0, self.goal_range / 2.0, self.goal_range]
    }
}

#[derive(Debug, Clone)]
struct ReachState {
    ee_position: [f32; 3],
    ee_velocity: [f32; 3],
    goal: [f32; 3],
}

/// Panda end-effector reaching environment
pub struct PandaReachEnv {
    /// Task parameters
    config: ReachConfig,
    /// Current state, `None` until the first reset
    state: Option<ReachState>,
    rng: StdRng,
}

impl PandaReachEnv {
    /// Create the environment from a generic environment config
    ///
    /// Task parameters are read from `config.params` (for example
    /// `{"reward_type": "dense"}`); missing keys take their defaults.
    pub fn new(config: EnvironmentConfig) -> Result<Self> {
        let reach: ReachConfig = serde_json::from_value(serde_json::Value::Object(config.params))?;
        Self::with_config(reach, config.seed)
    }

    /// Create the environment from explicit task parameters
    pub fn with_config(config: ReachConfig, seed: Option<u64>) -> Result<Self> {
        config.validate()?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            state: None,
            rng,
        })
    }

    /// Task parameters
    #[must_use]
    pub fn config(&self) -> &ReachConfig {
        &self.config
    }

    /// Current goal, if the environment has been reset
    #[must_use]
    pub fn goal(&self) -> Option<[f32; 3]> {
        self.state.as_ref().map(|s| s.goal)
    }

    /// Current end-effector position, if the environment has been reset
    #[must_use]
    pub fn ee_position(&self) -> Option<[f32; 3]> {
        self.state.as_ref().map(|s| s.ee_position)
    }

    fn sample_goal(&mut self) -> [f32; 3] {
        let low = self.config.goal_low();
        let high = self.config.goal_high();
        let mut goal = [0.0; 3];
        for i in 0..3 {
            goal[i] = self.rng.gen_range(low[i]..=high[i]);
        }
        goal
    }

    fn get_observation(&self, state: &ReachState) -> VectorObservation {
        let bound = self.config.observation_bound;
        let data = state
            .ee_position
            .iter()
            .chain(&state.ee_velocity)
            .chain(&state.ee_position)
            .chain(&state.goal)
            .map(|v| v.clamp(-bound, bound))
            .collect();
        VectorObservation::new(data)
    }
}

/// Euclidean distance between two points
#[must_use]
pub fn distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

#[async_trait]
impl Environment for PandaReachEnv {
    fn observation_space(&self) -> BoxSpace {
        let bound = self.config.observation_bound;
        BoxSpace::uniform(-bound, bound, vec![OBSERVATION_DIM])
    }

    fn action_space(&self) -> BoxSpace {
        BoxSpace::uniform(-1.0, 1.0, vec![ACTION_DIM])
    }

    fn seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    async fn reset(&mut self) -> Result<(VectorObservation, StepInfo)> {
        let goal = self.sample_goal();
        let state = ReachState {
            ee_position: self.config.initial_ee_position,
            ee_velocity: [0.0; 3],
            goal,
        };
        let observation = self.get_observation(&state);
        self.state = Some(state);

        let mut info = StepInfo::default();
        info.insert(StepInfo::IS_SUCCESS, false);
        Ok((observation, info))
    }

    async fn step(&mut self, action: &ContinuousAction) -> Result<Step> {
        if action.dim() != ACTION_DIM {
            return Err(RLError::DimensionMismatch {
                expected: ACTION_DIM,
                actual: action.dim(),
            });
        }
        if action.as_slice().iter().any(|a| !a.is_finite()) {
            return Err(RLError::InvalidAction(format!("non-finite action {:?}", action.0)));
        }

        let config = &self.config;
        let mut state = self
            .state
            .take()
            .ok_or_else(|| RLError::Environment("step() called before reset()".to_string()))?;

        for i in 0..3 {
            let command = action.0[i].clamp(-1.0, 1.0) * config.action_scale;
            let target = (state.ee_position[i] + command)
                .clamp(config.workspace_low[i], config.workspace_high[i]);
            state.ee_velocity[i] = (target - state.ee_position[i]) / config.time_step;
            state.ee_position[i] = target;
        }

        let d = distance(&state.ee_position, &state.goal);
        let success = d < config.distance_threshold;
        let reward = config.reward_type.reward(d, config.distance_threshold);

        let observation = self.get_observation(&state);
        self.state = Some(state);

        let mut info = StepInfo::default();
        info.insert(StepInfo::IS_SUCCESS, success);

        Ok(Step {
            observation,
            reward,
            done: success,
            truncated: false,
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn env(seed: u64) -> PandaReachEnv {
        PandaReachEnv::with_config(ReachConfig::default(), Some(seed)).unwrap()
    }

    /// Unit action pointing at the goal, or zero when already there
    fn toward(from: [f32; 3], to: [f32; 3]) -> ContinuousAction {
        let delta: Vec<f32> = from.iter().zip(&to).map(|(a, b)| b - a).collect();
        let norm = delta.iter().map(|d| d * d).sum::<f32>().sqrt();
        if norm < 1e-6 {
            return ContinuousAction(vec![0.0; 3]);
        }
        let scale = (norm / 0.05).min(1.0) / norm;
        ContinuousAction(delta.iter().map(|d| d * scale).collect())
    }

    #[tokio::test]
    async fn reset_produces_goal_inside_sampling_box() {
        let mut env = env(3);
        for _ in 0..50 {
            let (obs, info) = env.reset().await.unwrap();
            assert_eq!(obs.data.len(), OBSERVATION_DIM);
            assert!(!info.is_success());
            let goal = env.goal().unwrap();
            assert!(goal[0].abs() <= 0.15 && goal[1].abs() <= 0.15);
            assert!((0.0..=0.3).contains(&goal[2]));
            assert_eq!(&obs.data[9..12], &goal);
            assert_eq!(&obs.data[0..3], &obs.data[6..9]);
        }
    }

    #[tokio::test]
    async fn same_seed_same_goals() {
        let mut a = env(11);
        let mut b = env(11);
        for _ in 0..5 {
            let (oa, _) = a.reset().await.unwrap();
            let (ob, _) = b.reset().await.unwrap();
            assert_eq!(oa, ob);
        }
    }

    #[tokio::test]
    async fn driving_to_the_goal_terminates_with_zero_reward() {
        let mut env = env(5);
        env.reset().await.unwrap();
        let goal = env.goal().unwrap();

        let mut last = None;
        for _ in 0..50 {
            let action = toward(env.ee_position().unwrap(), goal);
            let step = env.step(&action).await.unwrap();
            let done = step.done;
            last = Some(step);
            if done {
                break;
            }
        }

        let last = last.unwrap();
        assert!(last.done);
        assert!(last.info.is_success());
        assert_relative_eq!(last.reward.0, 0.0);
    }

    #[tokio::test]
    async fn sparse_reward_is_negative_away_from_goal() {
        let mut env = env(9);
        env.reset().await.unwrap();
        let goal = env.goal().unwrap();
        let away = toward(goal, env.ee_position().unwrap());
        let step = env.step(&away).await.unwrap();
        if !step.done {
            assert_relative_eq!(step.reward.0, -1.0);
        }
    }

    #[tokio::test]
    async fn velocity_reflects_displacement() {
        let mut env = env(1);
        env.reset().await.unwrap();
        let step = env
            .step(&ContinuousAction(vec![1.0, 0.0, -1.0]))
            .await
            .unwrap();
        assert_relative_eq!(step.observation.data[0], 0.05, epsilon = 1e-6);
        assert_relative_eq!(step.observation.data[3], 1.25, epsilon = 1e-4);
        assert_relative_eq!(step.observation.data[5], -1.25, epsilon = 1e-4);
    }

    #[tokio::test]
    async fn dense_reward_from_params() {
        let mut params = serde_json::Map::new();
        params.insert("reward_type".to_string(), "dense".into());
        let config = EnvironmentConfig {
            seed: Some(2),
            params,
            ..EnvironmentConfig::default()
        };
        let mut env = PandaReachEnv::new(config).unwrap();
        assert_eq!(env.config().reward_type, RewardType::Dense);

        env.reset().await.unwrap();
        let step = env.step(&ContinuousAction(vec![0.0; 3])).await.unwrap();
        let d = distance(&env.ee_position().unwrap(), &env.goal().unwrap());
        assert_relative_eq!(step.reward.0, -d, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn rejects_wrong_action_width_and_step_before_reset() {
        let mut env = env(0);
        let err = env.step(&ContinuousAction(vec![0.0; 3])).await.unwrap_err();
        assert!(matches!(err, RLError::Environment(_)));

        env.reset().await.unwrap();
        let err = env.step(&ContinuousAction(vec![0.0; 2])).await.unwrap_err();
        assert!(matches!(err, RLError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ReachConfig {
            distance_threshold: 0.0,
            ..ReachConfig::default()
        };
        assert!(PandaReachEnv::with_config(config, None).is_err());
    }
}
