//! Subset of the ONNX protobuf schema needed to describe a feed-forward policy
//!
//! Field tags follow `onnx.proto`. Only the messages and fields the exporter
//! writes are declared; decoders skip everything else.

use prost::{Message, Oneof};

/// `TensorProto.DataType.FLOAT`
pub const DATA_TYPE_FLOAT: i32 = 1;

/// `AttributeProto.AttributeType.FLOAT`
pub const ATTRIBUTE_FLOAT: i32 = 1;

/// `AttributeProto.AttributeType.INT`
pub const ATTRIBUTE_INT: i32 = 2;

/// Top-level model container
#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    /// IR version of the file format
    #[prost(int64, tag = "1")]
    pub ir_version: i64,
    /// Tool that produced the model
    #[prost(string, tag = "2")]
    pub producer_name: String,
    /// Version of the producing tool
    #[prost(string, tag = "3")]
    pub producer_version: String,
    /// The computation graph
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    /// Operator sets the graph relies on
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
}

/// Operator set reference
#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    /// Empty for the default `ai.onnx` domain
    #[prost(string, tag = "1")]
    pub domain: String,
    /// Opset version
    #[prost(int64, tag = "2")]
    pub version: i64,
}

/// Computation graph
#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    /// Nodes in topological order
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    /// Graph name
    #[prost(string, tag = "2")]
    pub name: String,
    /// Constant tensors (the learned parameters)
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
    /// Runtime inputs
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    /// Graph outputs
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
}

/// One operator application
#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub op_type: String,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
    #[prost(string, tag = "7")]
    pub domain: String,
}

/// Named operator attribute
#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(float, tag = "2")]
    pub f: f32,
    #[prost(int64, tag = "3")]
    pub i: i64,
    /// Discriminates which value field is set
    #[prost(int32, tag = "20")]
    pub r#type: i32,
}

impl AttributeProto {
    /// Float-valued attribute
    #[must_use]
    pub fn float(name: &str, value: f32) -> Self {
        Self {
            name: name.to_string(),
            f: value,
            r#type: ATTRIBUTE_FLOAT,
            ..Self::default()
        }
    }

    /// Integer-valued attribute
    #[must_use]
    pub fn int(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            i: value,
            r#type: ATTRIBUTE_INT,
            ..Self::default()
        }
    }
}

/// Dense tensor, stored little-endian in `raw_data`
#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    pub dims: Vec<i64>,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(float, repeated, tag = "4")]
    pub float_data: Vec<f32>,
    #[prost(string, tag = "8")]
    pub name: String,
    #[prost(bytes = "vec", tag = "9")]
    pub raw_data: Vec<u8>,
}

impl TensorProto {
    /// Float tensor named `name` with the given shape and row-major values
    #[must_use]
    pub fn float(name: &str, dims: &[usize], values: impl IntoIterator<Item = f32>) -> Self {
        Self {
            dims: dims.iter().map(|&d| to_dim(d)).collect(),
            data_type: DATA_TYPE_FLOAT,
            name: name.to_string(),
            raw_data: values.into_iter().flat_map(f32::to_le_bytes).collect(),
            ..Self::default()
        }
    }

    /// Decoded float values, from either `raw_data` or `float_data`
    #[must_use]
    pub fn floats(&self) -> Vec<f32> {
        if self.raw_data.is_empty() {
            return self.float_data.clone();
        }
        self.raw_data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

/// Name and type of a graph input or output
#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

impl ValueInfoProto {
    /// Float tensor value with the given dimensions
    #[must_use]
    pub fn float_tensor(name: &str, dims: Vec<Dimension>) -> Self {
        Self {
            name: name.to_string(),
            r#type: Some(TypeProto {
                tensor_type: Some(TensorTypeProto {
                    elem_type: DATA_TYPE_FLOAT,
                    shape: Some(TensorShapeProto { dim: dims }),
                }),
            }),
        }
    }

    /// Declared dimensions, empty when the type is missing
    #[must_use]
    pub fn dims(&self) -> &[Dimension] {
        self.r#type
            .as_ref()
            .and_then(|t| t.tensor_type.as_ref())
            .and_then(|t| t.shape.as_ref())
            .map(|s| s.dim.as_slice())
            .unwrap_or(&[])
    }
}

/// Value type; only tensors are used
#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(message, optional, tag = "1")]
    pub tensor_type: Option<TensorTypeProto>,
}

/// `TypeProto.Tensor`
#[derive(Clone, PartialEq, Message)]
pub struct TensorTypeProto {
    #[prost(int32, tag = "1")]
    pub elem_type: i32,
    #[prost(message, optional, tag = "2")]
    pub shape: Option<TensorShapeProto>,
}

/// Tensor shape
#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<Dimension>,
}

/// `TensorShapeProto.Dimension`
#[derive(Clone, PartialEq, Message)]
pub struct Dimension {
    #[prost(oneof = "DimensionValue", tags = "1, 2")]
    pub value: Option<DimensionValue>,
}

impl Dimension {
    /// Fixed size
    #[must_use]
    pub fn fixed(size: usize) -> Self {
        Self {
            value: Some(DimensionValue::DimValue(to_dim(size))),
        }
    }

    /// Symbolic size resolved at run time
    #[must_use]
    pub fn symbolic(name: &str) -> Self {
        Self {
            value: Some(DimensionValue::DimParam(name.to_string())),
        }
    }
}

/// Either a concrete size or a symbolic name
#[derive(Clone, PartialEq, Oneof)]
pub enum DimensionValue {
    #[prost(int64, tag = "1")]
    DimValue(i64),
    #[prost(string, tag = "2")]
    DimParam(String),
}

fn to_dim(size: usize) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_tensor_data_is_little_endian() {
        let t = TensorProto::float("w", &[2], [1.0, -2.5]);
        assert_eq!(t.raw_data.len(), 8);
        assert_eq!(&t.raw_data[..4], &1.0f32.to_le_bytes());
        assert_eq!(t.floats(), vec![1.0, -2.5]);
    }

    #[test]
    fn symbolic_dimension_survives_encoding() {
        let vi = ValueInfoProto::float_tensor(
            "input",
            vec![Dimension::symbolic("batch_size"), Dimension::fixed(12)],
        );
        let decoded = ValueInfoProto::decode(vi.encode_to_vec().as_slice()).unwrap();
        assert_eq!(
            decoded.dims()[0].value,
            Some(DimensionValue::DimParam("batch_size".to_string()))
        );
        assert_eq!(decoded.dims()[1].value, Some(DimensionValue::DimValue(12)));
    }
}
