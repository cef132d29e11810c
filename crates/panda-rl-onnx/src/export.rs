//! Trace an [`InferencePolicy`] and write it as an ONNX model

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::Array2;
use prost::Message;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use tokio::fs;
use tracing::{debug, info};

use panda_rl_core::RLError;

use crate::proto::{Dimension, GraphProto, ModelProto, OperatorSetIdProto, ValueInfoProto};
use crate::tracer::Tracer;
use crate::wrapper::InferencePolicy;

/// ONNX IR version written into exported models
pub const IR_VERSION: i64 = 6;

/// Default operator set version
pub const OPSET_VERSION: i64 = 11;

/// Default graph input name
pub const INPUT_NAME: &str = "input";

/// Default graph output name
pub const OUTPUT_NAME: &str = "output";

/// Symbolic name of the dynamic batch dimension
pub const BATCH_DIM_PARAM: &str = "batch_size";

const PRODUCER_NAME: &str = "panda-rl-onnx";

/// How the graph is traced and declared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnnxExportOptions {
    /// Operator set version
    pub opset_version: i64,
    /// Name of the observation input
    pub input_name: String,
    /// Name of the action output
    pub output_name: String,
    /// Declare dimension 0 of input and output as `batch_size`
    pub dynamic_batch: bool,
    /// Seed for the dummy trace input; random when `None`
    pub seed: Option<u64>,
}

impl Default for OnnxExportOptions {
    fn default() -> Self {
        Self {
            opset_version: OPSET_VERSION,
            input_name: INPUT_NAME.to_string(),
            output_name: OUTPUT_NAME.to_string(),
            dynamic_batch: true,
            seed: None,
        }
    }
}

/// What [`export_onnx`] produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    /// Written model file
    pub path: PathBuf,
    /// Encoded size
    pub bytes: usize,
    /// Operator nodes in the graph
    pub nodes: usize,
    /// Observation width
    pub obs_dim: usize,
    /// Action width
    pub act_dim: usize,
}

/// Standard-normal `(1, obs_dim)` batch used to drive the trace
#[must_use]
pub fn dummy_input(obs_dim: usize, seed: Option<u64>) -> Array2<f32> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    Array2::from_shape_simple_fn((1, obs_dim), || StandardNormal.sample(&mut rng))
}

/// Record the forward pass of `policy` on `dummy` as an ONNX model
pub fn trace_model(
    policy: &InferencePolicy,
    dummy: Array2<f32>,
    options: &OnnxExportOptions,
) -> Result<ModelProto> {
    if dummy.ncols() != policy.obs_dim() {
        bail!(RLError::DimensionMismatch {
            expected: policy.obs_dim(),
            actual: dummy.ncols(),
        });
    }
    let traced_batch = dummy.nrows();

    let mut tracer = Tracer::new();
    let output = policy.forward_with(&mut tracer, Tracer::input(&options.input_name, dummy))?;
    if output.data.iter().any(|v| !v.is_finite()) {
        bail!(RLError::Export("trace produced non-finite actions".to_string()));
    }
    let (node, initializer) = tracer.finish(&output, &options.output_name)?;

    let batch = || {
        if options.dynamic_batch {
            Dimension::symbolic(BATCH_DIM_PARAM)
        } else {
            Dimension::fixed(traced_batch)
        }
    };
    let graph = GraphProto {
        node,
        name: "main_graph".to_string(),
        initializer,
        input: vec![ValueInfoProto::float_tensor(
            &options.input_name,
            vec![batch(), Dimension::fixed(policy.obs_dim())],
        )],
        output: vec![ValueInfoProto::float_tensor(
            &options.output_name,
            vec![batch(), Dimension::fixed(policy.act_dim())],
        )],
    };

    Ok(ModelProto {
        ir_version: IR_VERSION,
        producer_name: PRODUCER_NAME.to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: options.opset_version,
        }],
    })
}

/// Protobuf encoding of `model`
#[must_use]
pub fn encode_model(model: &ModelProto) -> Vec<u8> {
    model.encode_to_vec()
}

/// Parse an encoded model
pub fn decode_model(bytes: &[u8]) -> Result<ModelProto> {
    ModelProto::decode(bytes).map_err(|e| RLError::Export(format!("invalid ONNX model: {e}")).into())
}

/// Write `bytes` to `path` through a sibling temporary file
pub async fn write_model(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to move model into {}", path.display()))?;
    Ok(())
}

/// Read and parse a model file
pub async fn read_model(path: impl AsRef<Path>) -> Result<ModelProto> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    decode_model(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

/// Trace `policy` on a dummy `(1, obs_dim)` input and write the model to `path`
///
/// The model is fully encoded before the filesystem is touched, so a failed
/// trace leaves no file behind.
pub async fn export_onnx(
    policy: &InferencePolicy,
    path: impl AsRef<Path>,
    options: &OnnxExportOptions,
) -> Result<ExportSummary> {
    let path = path.as_ref();
    let dummy = dummy_input(policy.obs_dim(), options.seed);
    debug!(shape = ?dummy.shape(), "tracing inference policy");

    let model = trace_model(policy, dummy, options)?;
    let nodes = model.graph.as_ref().map_or(0, |g| g.node.len());
    let bytes = encode_model(&model);
    write_model(path, &bytes).await?;

    info!(
        path = %path.display(),
        bytes = bytes.len(),
        nodes,
        opset = options.opset_version,
        "exported ONNX model"
    );
    Ok(ExportSummary {
        path: path.to_path_buf(),
        bytes: bytes.len(),
        nodes,
        obs_dim: policy.obs_dim(),
        act_dim: policy.act_dim(),
    })
}
