//! Reinforcement learning environments for the Panda reach workspace
//!
//! This crate provides:
//! - `PandaReachEnv`, a kinematic end-effector reaching task
//! - an id-based registry (`make_env`, `make_vec_env`)
//! - the time-limit wrapper
//! - `VecEnv`, a sequential vectorized environment with auto-reset

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod panda_reach;
pub mod registry;
pub mod vec_env;
pub mod wrappers;

// Re-export environments
pub use panda_reach::{PandaReachEnv, ReachConfig};
pub use registry::{
    make_env, make_vec_env, make_vec_env_with, EnvRegistry, DEFAULT_MAX_EPISODE_STEPS,
    PANDA_REACH_DENSE_V3, PANDA_REACH_V3,
};
pub use vec_env::{VecEnv, VecStep};
pub use wrappers::TimeLimit;

// Re-export core types
pub use panda_rl_core::{
    BoxSpace, ContinuousAction, Environment, EnvironmentConfig, Episode, Reward, Step, StepInfo,
    VectorObservation,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{make_env, make_vec_env, EnvRegistry, PandaReachEnv, TimeLimit, VecEnv};
    pub use panda_rl_core::prelude::*;
}
