//! Environment registry for id-based environment creation

use std::collections::HashMap;

use panda_rl_core::{Environment, EnvironmentConfig, RLError, Result, TrackedEnvironment};
use tracing::debug;

use crate::{PandaReachEnv, ReachConfig, TimeLimit, VecEnv};

/// Sparse-reward Panda reach task
pub const PANDA_REACH_V3: &str = "PandaReach-v3";
/// Dense-reward Panda reach task
pub const PANDA_REACH_DENSE_V3: &str = "PandaReachDense-v3";

/// Episode length applied to registered reach tasks
pub const DEFAULT_MAX_EPISODE_STEPS: usize = 50;

type BoxedEnv = Box<dyn Environment>;

type EnvConstructor = Box<dyn Fn(EnvironmentConfig) -> Result<BoxedEnv> + Send + Sync>;

struct EnvSpec {
    constructor: EnvConstructor,
    max_episode_steps: Option<usize>,
}

/// Environment registry
pub struct EnvRegistry {
    /// Registered environments
    envs: HashMap<String, EnvSpec>,
}

impl Default for EnvRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl EnvRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            envs: HashMap::new(),
        }
    }

    /// Registry holding the built-in reach tasks
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PANDA_REACH_V3, Some(DEFAULT_MAX_EPISODE_STEPS), |config| {
            Ok(Box::new(PandaReachEnv::new(config)?) as BoxedEnv)
        });
        registry.register(
            PANDA_REACH_DENSE_V3,
            Some(DEFAULT_MAX_EPISODE_STEPS),
            |mut config| {
                config
                    .params
                    .insert("reward_type".to_string(), "dense".into());
                Ok(Box::new(PandaReachEnv::new(config)?) as BoxedEnv)
            },
        );
        registry
    }

    /// Register an environment
    pub fn register<F>(&mut self, id: impl Into<String>, max_episode_steps: Option<usize>, constructor: F)
    where
        F: Fn(EnvironmentConfig) -> Result<BoxedEnv> + Send + Sync + 'static,
    {
        self.envs.insert(
            id.into(),
            EnvSpec {
                constructor: Box::new(constructor),
                max_episode_steps,
            },
        );
    }

    /// Create an environment by id, applying its registered time limit
    ///
    /// `config.max_steps` overrides the registered episode length.
    pub fn make(&self, id: &str, config: EnvironmentConfig) -> Result<BoxedEnv> {
        let spec = self
            .envs
            .get(id)
            .ok_or_else(|| RLError::UnknownEnvironment(id.to_string()))?;
        let max_steps = config.max_steps.or(spec.max_episode_steps);
        let env = (spec.constructor)(config)?;
        debug!(id, ?max_steps, "created environment");
        Ok(match max_steps {
            Some(max_steps) => Box::new(TimeLimit::new(env, max_steps)) as BoxedEnv,
            None => env,
        })
    }

    /// Registered environment ids, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.envs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether `id` is registered
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.envs.contains_key(id)
    }
}

/// Create a built-in environment by id
pub fn make_env(id: &str, config: EnvironmentConfig) -> Result<BoxedEnv> {
    EnvRegistry::with_defaults().make(id, config)
}

/// Create `n_envs` monitored copies of a built-in environment
///
/// Copy `i` is seeded with `seed + i` when a seed is given.
pub fn make_vec_env(id: &str, n_envs: usize, seed: Option<u64>) -> Result<VecEnv> {
    let registry = EnvRegistry::with_defaults();
    make_vec_env_with(&registry, id, n_envs, seed, &ReachConfig::default())
}

/// Create `n_envs` monitored copies of an environment from `registry`
///
/// `reach` is forwarded to every copy as task parameters.
pub fn make_vec_env_with(
    registry: &EnvRegistry,
    id: &str,
    n_envs: usize,
    seed: Option<u64>,
    reach: &ReachConfig,
) -> Result<VecEnv> {
    if n_envs == 0 {
        return Err(RLError::Config("n_envs must be at least 1".to_string()));
    }
    let params = match serde_json::to_value(reach)? {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    let mut envs: Vec<BoxedEnv> = Vec::with_capacity(n_envs);
    for i in 0..n_envs {
        let config = EnvironmentConfig {
            seed: seed.map(|s| s.wrapping_add(i as u64)),
            params: params.clone(),
            ..EnvironmentConfig::default()
        };
        let env = registry.make(id, config)?;
        envs.push(Box::new(TrackedEnvironment::new(env)));
    }
    VecEnv::new(envs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use panda_rl_core::ContinuousAction;

    #[test]
    fn default_registry_lists_reach_tasks() {
        let registry = EnvRegistry::default();
        assert_eq!(
            registry.ids(),
            vec![PANDA_REACH_V3.to_string(), PANDA_REACH_DENSE_V3.to_string()]
        );
        assert!(registry.contains(PANDA_REACH_V3));
    }

    #[test]
    fn unknown_id_is_an_error() {
        let err = make_env("CartPole-v1", EnvironmentConfig::default()).err().unwrap();
        assert!(matches!(err, RLError::UnknownEnvironment(id) if id == "CartPole-v1"));
    }

    #[tokio::test]
    async fn made_env_has_reach_spaces_and_time_limit() {
        let mut env = make_env(PANDA_REACH_V3, EnvironmentConfig::seeded(0)).unwrap();
        assert_eq!(env.observation_space().flat_dim(), 12);
        assert_eq!(env.action_space().flat_dim(), 3);

        env.reset().await.unwrap();
        let idle = ContinuousAction(vec![0.0; 3]);
        let mut ended = false;
        for _ in 0..DEFAULT_MAX_EPISODE_STEPS {
            let step = env.step(&idle).await.unwrap();
            if step.done || step.truncated {
                ended = true;
                break;
            }
        }
        assert!(ended);
    }

    #[tokio::test]
    async fn dense_variant_uses_distance_reward() {
        let mut env = make_env(PANDA_REACH_DENSE_V3, EnvironmentConfig::seeded(1)).unwrap();
        env.reset().await.unwrap();
        let step = env.step(&ContinuousAction(vec![0.0; 3])).await.unwrap();
        // Goals lie well within one meter of the start, so -distance never reaches -1
        assert!(step.reward.0 <= 0.0 && step.reward.0 > -1.0);
    }

    #[tokio::test]
    async fn seeds_wrap_past_u64_max() {
        let mut venv = make_vec_env(PANDA_REACH_V3, 4, Some(u64::MAX)).unwrap();
        assert_eq!(venv.num_envs(), 4);
        let obs = venv.reset().await.unwrap();

        // The second copy wraps around to seed 0
        let mut zero = make_vec_env(PANDA_REACH_V3, 1, Some(0)).unwrap();
        let expected = zero.reset().await.unwrap();
        assert_eq!(obs.row(1).to_vec(), expected.row(0).to_vec());
    }

    #[test]
    fn vec_env_rejects_zero_copies() {
        assert!(make_vec_env(PANDA_REACH_V3, 0, None).is_err());
    }
}
