//! Core reinforcement learning traits and types for the Panda reach workspace
//!
//! This crate provides the foundational abstractions shared by the
//! simulator, the learner and the exporter: bounded box spaces, vector
//! observations, continuous actions and the asynchronous environment trait.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod environment;
pub mod error;
pub mod observation;
pub mod reward;
pub mod space;

// Re-export core traits and types
pub use action::ContinuousAction;
pub use environment::{Environment, EnvironmentConfig, Episode, Step, StepInfo, TrackedEnvironment};
pub use error::{RLError, Result};
pub use observation::VectorObservation;
pub use reward::{Reward, RewardType};
pub use space::BoxSpace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        BoxSpace, ContinuousAction, Environment, EnvironmentConfig, Result, Reward, Step,
        StepInfo, VectorObservation,
    };
}
