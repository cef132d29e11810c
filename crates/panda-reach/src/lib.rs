//! Panda reach pipeline
//!
//! Two stages, each behind its own binary:
//! - `train`: PPO on the reach task with periodic checkpoints, a final model
//!   and a short deterministic evaluation
//! - `export`: the final model's action path as an ONNX graph

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod export;
pub mod telemetry;
pub mod train;

pub use export::{copy_artifact, export_policy, ExportConfig, ExportReport};
pub use telemetry::init_tracing;
pub use train::{evaluate, run_training, EvalReport, TrainConfig, TrainReport};
