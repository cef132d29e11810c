//! PPO learner for the Panda reach workspace
//!
//! This crate provides:
//! - an MLP actor-critic policy with a diagonal Gaussian action head
//! - hand-derived backpropagation and an Adam optimizer
//! - a rollout buffer with generalized advantage estimation
//! - the PPO learner, its callbacks and checkpoint persistence
//! - per-run progress logging

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod callbacks;
pub mod checkpoint;
pub mod logger;
pub mod nn;
pub mod optim;
pub mod policy;
pub mod ppo;
pub mod utils;

// Re-export the learner
pub use ppo::{ppo_loss, LossInfo, Ppo, PpoConfig, TrainStats};

// Re-export persistence and logging
pub use checkpoint::{final_checkpoint_name, periodic_checkpoint_name, Checkpoint};
pub use logger::{ProgressLogger, ProgressRecord};

// Re-export training components
pub use buffer::{RolloutBatch, RolloutBuffer};
pub use callbacks::{Callback, CheckpointCallback, NoopCallback};
pub use optim::Adam;

// Re-export policy components
pub use nn::{Linear, Mlp};
pub use policy::{ActorCriticPolicy, MlpExtractor, NetArch};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ActorCriticPolicy, Callback, Checkpoint, CheckpointCallback, NoopCallback, Ppo, PpoConfig,
        ProgressLogger,
    };
    pub use panda_rl_core::prelude::*;
}
