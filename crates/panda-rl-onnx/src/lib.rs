//! Inference-only policy wrapper and ONNX export
//!
//! This crate provides:
//! - [`InferencePolicy`], the action path of a trained actor-critic policy
//! - a tracing backend that records the forward pass as ONNX nodes
//! - the protobuf messages and writer for the exported model

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod export;
pub mod proto;
pub mod tracer;
pub mod wrapper;

pub use export::{
    decode_model, dummy_input, encode_model, export_onnx, read_model, trace_model, write_model,
    ExportSummary, OnnxExportOptions, BATCH_DIM_PARAM, INPUT_NAME, IR_VERSION, OPSET_VERSION,
    OUTPUT_NAME,
};
pub use proto::ModelProto;
pub use tracer::{Backend, Eager, Traced, Tracer};
pub use wrapper::InferencePolicy;
