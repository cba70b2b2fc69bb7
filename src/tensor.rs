//! Host tensors shared by the eager kernels, the tracer and the graph interpreter.

use ndarray::{ArrayD, IxDyn};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    I32,
    Bool,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "float32",
            DType::I32 => "int32",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Static shape and element type of a tensor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorMeta {
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    #[inline]
    pub fn f32(shape: impl Into<Vec<usize>>) -> Self {
        Self::new(shape, DType::F32)
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.shape, self.dtype)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Value {
    F32(ArrayD<f32>),
    I32(ArrayD<i32>),
    Bool(ArrayD<bool>),
}

impl Value {
    pub fn zeros(shape: &[usize]) -> Self {
        Value::F32(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn full_f32(shape: &[usize], value: f32) -> Self {
        Value::F32(ArrayD::from_elem(IxDyn(shape), value))
    }

    pub fn full_i32(shape: &[usize], value: i32) -> Self {
        Value::I32(ArrayD::from_elem(IxDyn(shape), value))
    }

    pub fn scalar_f32(value: f32) -> Self {
        Value::full_f32(&[], value)
    }

    pub fn scalar_i32(value: i32) -> Self {
        Value::full_i32(&[], value)
    }

    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self, Error> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Value::F32)
            .map_err(|e| Error::shape("from_f32", e.to_string()))
    }

    pub fn from_i32(shape: &[usize], data: Vec<i32>) -> Result<Self, Error> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Value::I32)
            .map_err(|e| Error::shape("from_i32", e.to_string()))
    }

    pub fn from_bool(shape: &[usize], data: Vec<bool>) -> Result<Self, Error> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Value::Bool)
            .map_err(|e| Error::shape("from_bool", e.to_string()))
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        match self {
            Value::F32(_) => DType::F32,
            Value::I32(_) => DType::I32,
            Value::Bool(_) => DType::Bool,
        }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        match self {
            Value::F32(a) => a.shape(),
            Value::I32(a) => a.shape(),
            Value::Bool(a) => a.shape(),
        }
    }

    #[inline]
    pub fn meta(&self) -> TensorMeta {
        TensorMeta::new(self.shape(), self.dtype())
    }

    pub fn as_f32(&self) -> Result<&ArrayD<f32>, Error> {
        match self {
            Value::F32(a) => Ok(a),
            other => Err(Error::DType {
                op: "as_f32",
                expected: DType::F32,
                found: other.dtype(),
            }),
        }
    }

    pub fn as_i32(&self) -> Result<&ArrayD<i32>, Error> {
        match self {
            Value::I32(a) => Ok(a),
            other => Err(Error::DType {
                op: "as_i32",
                expected: DType::I32,
                found: other.dtype(),
            }),
        }
    }

    pub fn as_bool(&self) -> Result<&ArrayD<bool>, Error> {
        match self {
            Value::Bool(a) => Ok(a),
            other => Err(Error::DType {
                op: "as_bool",
                expected: DType::Bool,
                found: other.dtype(),
            }),
        }
    }

    pub fn into_f32(self) -> Result<ArrayD<f32>, Error> {
        match self {
            Value::F32(a) => Ok(a),
            other => Err(Error::DType {
                op: "into_f32",
                expected: DType::F32,
                found: other.dtype(),
            }),
        }
    }

    /// Largest absolute element-wise difference between two float tensors of the same shape.
    /// Any NaN on either side counts as an infinite difference.
    pub fn max_abs_diff(&self, other: &Value) -> Result<f32, Error> {
        let (a, b) = (self.as_f32()?, other.as_f32()?);
        if a.shape() != b.shape() {
            return Err(Error::shape(
                "max_abs_diff",
                format!("{:?} vs {:?}", a.shape(), b.shape()),
            ));
        }

        Ok(a.iter()
            .zip(b.iter())
            .map(|(x, y)| match (x - y).abs() {
                d if d.is_nan() => f32::INFINITY,
                d => d,
            })
            .fold(0.0, f32::max))
    }
}

/// Numpy-style broadcast of two shapes, `None` when they are incompatible.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];

    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };

        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }

    Some(out)
}

/// Exclusive prefix sum of `h * w` over the flattened (camera, level) grid.
pub fn level_start_index(spatial_shapes: &[[usize; 2]], num_cams: usize) -> Vec<i32> {
    let mut starts = Vec::with_capacity(num_cams * spatial_shapes.len());
    let mut offset = 0usize;

    for _ in 0..num_cams {
        for [h, w] in spatial_shapes {
            starts.push(offset as i32);
            offset += h * w;
        }
    }

    starts
}
