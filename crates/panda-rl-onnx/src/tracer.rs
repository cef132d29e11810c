//! Execution backends for the inference forward pass
//!
//! [`InferencePolicy::forward_with`](crate::InferencePolicy::forward_with) is
//! written once against [`Backend`]. [`Eager`] evaluates it on `ndarray`
//! values; [`Tracer`] evaluates it too, but also records every operation as
//! an ONNX node and every parameter as an initializer.

use anyhow::{bail, Result};
use ndarray::Array2;
use tracing::trace;

use panda_rl_agent::Linear;
use panda_rl_core::RLError;

use crate::proto::{AttributeProto, NodeProto, TensorProto};

/// Operations the inference graph is built from
///
/// `scope` is the dotted module path of the operation, e.g.
/// `extractor.policy_net.0`.
pub trait Backend {
    /// Value flowing between operations
    type Value;

    /// `x · Wᵀ + b`
    fn linear(&mut self, scope: &str, layer: &Linear, x: Self::Value) -> Result<Self::Value>;

    /// Element-wise `tanh`
    fn tanh(&mut self, scope: &str, x: Self::Value) -> Result<Self::Value>;
}

fn check_width(layer: &Linear, x: &Array2<f32>) -> Result<()> {
    if x.ncols() != layer.in_features() {
        bail!(RLError::DimensionMismatch {
            expected: layer.in_features(),
            actual: x.ncols(),
        });
    }
    Ok(())
}

/// Plain numeric evaluation
#[derive(Debug, Default, Clone, Copy)]
pub struct Eager;

impl Backend for Eager {
    type Value = Array2<f32>;

    fn linear(&mut self, _scope: &str, layer: &Linear, x: Array2<f32>) -> Result<Array2<f32>> {
        check_width(layer, &x)?;
        Ok(layer.forward(&x.view()))
    }

    fn tanh(&mut self, _scope: &str, x: Array2<f32>) -> Result<Array2<f32>> {
        Ok(x.mapv(f32::tanh))
    }
}

/// A value seen by the tracer: its graph name plus its concrete data
#[derive(Debug, Clone)]
pub struct Traced {
    /// Name of the graph edge carrying this value
    pub name: String,
    /// Value computed for the trace input
    pub data: Array2<f32>,
}

/// Records operations into ONNX nodes while evaluating them
#[derive(Debug, Default)]
pub struct Tracer {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
}

impl Tracer {
    /// Empty trace
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph input named `name` carrying `data`
    #[must_use]
    pub fn input(name: &str, data: Array2<f32>) -> Traced {
        Traced {
            name: name.to_string(),
            data,
        }
    }

    /// Nodes recorded so far
    #[must_use]
    pub fn nodes(&self) -> &[NodeProto] {
        &self.nodes
    }

    /// Initializers recorded so far
    #[must_use]
    pub fn initializers(&self) -> &[TensorProto] {
        &self.initializers
    }

    /// Rename the edge carrying `output` to `output_name` and return the graph parts
    pub fn finish(
        mut self,
        output: &Traced,
        output_name: &str,
    ) -> Result<(Vec<NodeProto>, Vec<TensorProto>)> {
        let Some(node) = self
            .nodes
            .iter_mut()
            .rev()
            .find(|n| n.output.iter().any(|o| o == &output.name))
        else {
            bail!(RLError::Export(format!(
                "traced output `{}` is not produced by any node",
                output.name
            )));
        };
        for o in &mut node.output {
            if o == &output.name {
                *o = output_name.to_string();
            }
        }
        Ok((self.nodes, self.initializers))
    }

    fn record(&mut self, scope: &str, op_type: &str, inputs: Vec<String>, attribute: Vec<AttributeProto>) -> String {
        let path = scope.replace('.', "/");
        let name = format!("/{path}/{op_type}");
        let output = format!("{name}_output_0");
        trace!(node = %name, "traced");
        self.nodes.push(NodeProto {
            input: inputs,
            output: vec![output.clone()],
            name,
            op_type: op_type.to_string(),
            attribute,
            domain: String::new(),
        });
        output
    }
}

impl Backend for Tracer {
    type Value = Traced;

    fn linear(&mut self, scope: &str, layer: &Linear, x: Traced) -> Result<Traced> {
        check_width(layer, &x.data)?;
        let weight = format!("{scope}.weight");
        let bias = format!("{scope}.bias");
        self.initializers.push(TensorProto::float(
            &weight,
            &[layer.out_features(), layer.in_features()],
            layer.weight.iter().copied(),
        ));
        self.initializers.push(TensorProto::float(
            &bias,
            &[layer.out_features()],
            layer.bias.iter().copied(),
        ));

        let name = self.record(
            scope,
            "Gemm",
            vec![x.name, weight, bias],
            vec![
                AttributeProto::float("alpha", 1.0),
                AttributeProto::float("beta", 1.0),
                AttributeProto::int("transB", 1),
            ],
        );
        Ok(Traced {
            name,
            data: layer.forward(&x.data.view()),
        })
    }

    fn tanh(&mut self, scope: &str, x: Traced) -> Result<Traced> {
        let name = self.record(scope, "Tanh", vec![x.name], Vec::new());
        Ok(Traced {
            name,
            data: x.data.mapv(f32::tanh),
        })
    }
}
