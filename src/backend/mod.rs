//! Execution backends for the decoder head.
//!
//! Every layer in this crate is written against [`Backend`], so the same forward code either
//! computes values immediately ([`Eager`]) or records a static graph ([`Tracer`]). Both funnel
//! through a single `apply(op, inputs)` hook; the convenience methods below only build [`Op`]s.

mod eager;
pub mod kernels;
mod tracer;

pub use eager::Eager;
pub use tracer::{Traced, Tracer};

use serde_derive::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;
use crate::tensor::{TensorMeta, Value};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    Exp,
    Neg,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceKind {
    Sum,
    Max,
}

/// Primitive tensor operation. Every variant has a static shape rule in [`crate::graph::infer`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Op {
    Binary(BinaryOp),
    Unary(UnaryOp),
    ClampMin(f32),
    /// Batched matrix product with numpy broadcasting over the leading axes.
    MatMul,
    Softmax { axis: usize },
    /// Normalizes over the last axis; inputs are `(x, gamma, beta)`.
    LayerNorm { eps: f32 },
    Reshape { shape: Vec<usize> },
    Permute { axes: Vec<usize> },
    Concat { axis: usize },
    Slice { axis: usize, start: usize, end: usize },
    Reduce { kind: ReduceKind, axis: usize },
    /// Largest `k` entries along the last axis; outputs `(values, indices)`.
    TopK { k: usize },
    /// `(data[b, n, ..], indices[b, k]) -> out[b, k, ..]`.
    Gather,
    /// `(mask, on_true, on_false)` with broadcasting.
    Select,
    /// `(feature, spatial_shapes, level_start_index, sampling_location, weights)`.
    DeformableAggregation,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Binary(BinaryOp::Add) => "add",
            Op::Binary(BinaryOp::Sub) => "sub",
            Op::Binary(BinaryOp::Mul) => "mul",
            Op::Binary(BinaryOp::Div) => "div",
            Op::Binary(BinaryOp::Max) => "max",
            Op::Unary(UnaryOp::Relu) => "relu",
            Op::Unary(UnaryOp::Sigmoid) => "sigmoid",
            Op::Unary(UnaryOp::Exp) => "exp",
            Op::Unary(UnaryOp::Neg) => "neg",
            Op::ClampMin(_) => "clamp_min",
            Op::MatMul => "matmul",
            Op::Softmax { .. } => "softmax",
            Op::LayerNorm { .. } => "layer_norm",
            Op::Reshape { .. } => "reshape",
            Op::Permute { .. } => "permute",
            Op::Concat { .. } => "concat",
            Op::Slice { .. } => "slice",
            Op::Reduce {
                kind: ReduceKind::Sum,
                ..
            } => "reduce_sum",
            Op::Reduce {
                kind: ReduceKind::Max,
                ..
            } => "reduce_max",
            Op::TopK { .. } => "top_k",
            Op::Gather => "gather",
            Op::Select => "select",
            Op::DeformableAggregation => "deformable_aggregation",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait Backend {
    type Tensor: Clone + fmt::Debug;

    fn meta(&self, tensor: &Self::Tensor) -> TensorMeta;

    /// Lifts a host value (parameters, literals) into the backend.
    fn constant(&self, value: Value) -> Result<Self::Tensor, Error>;

    fn apply(&self, op: Op, inputs: &[&Self::Tensor]) -> Result<Vec<Self::Tensor>, Error>;

    fn apply1(&self, op: Op, inputs: &[&Self::Tensor]) -> Result<Self::Tensor, Error> {
        let name = op.name();
        let mut outputs = self.apply(op, inputs)?;
        match outputs.len() {
            1 => Ok(outputs.remove(0)),
            n => Err(Error::shape(name, format!("expected one output, got {}", n))),
        }
    }

    #[inline]
    fn shape(&self, tensor: &Self::Tensor) -> Vec<usize> {
        self.meta(tensor).shape
    }

    fn scalar(&self, value: f32) -> Result<Self::Tensor, Error> {
        self.constant(Value::scalar_f32(value))
    }

    fn add(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Binary(BinaryOp::Add), &[a, b])
    }

    fn sub(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Binary(BinaryOp::Sub), &[a, b])
    }

    fn mul(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Binary(BinaryOp::Mul), &[a, b])
    }

    fn div(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Binary(BinaryOp::Div), &[a, b])
    }

    fn maximum(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Binary(BinaryOp::Max), &[a, b])
    }

    fn relu(&self, x: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Unary(UnaryOp::Relu), &[x])
    }

    fn sigmoid(&self, x: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Unary(UnaryOp::Sigmoid), &[x])
    }

    fn exp(&self, x: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Unary(UnaryOp::Exp), &[x])
    }

    fn neg(&self, x: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Unary(UnaryOp::Neg), &[x])
    }

    fn clamp_min(&self, x: &Self::Tensor, min: f32) -> Result<Self::Tensor, Error> {
        self.apply1(Op::ClampMin(min), &[x])
    }

    fn matmul(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::MatMul, &[a, b])
    }

    fn softmax(&self, x: &Self::Tensor, axis: usize) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Softmax { axis }, &[x])
    }

    fn layer_norm(
        &self,
        x: &Self::Tensor,
        gamma: &Self::Tensor,
        beta: &Self::Tensor,
        eps: f32,
    ) -> Result<Self::Tensor, Error> {
        self.apply1(Op::LayerNorm { eps }, &[x, gamma, beta])
    }

    fn reshape(&self, x: &Self::Tensor, shape: &[usize]) -> Result<Self::Tensor, Error> {
        self.apply1(
            Op::Reshape {
                shape: shape.to_vec(),
            },
            &[x],
        )
    }

    fn permute(&self, x: &Self::Tensor, axes: &[usize]) -> Result<Self::Tensor, Error> {
        self.apply1(
            Op::Permute {
                axes: axes.to_vec(),
            },
            &[x],
        )
    }

    fn concat(&self, xs: &[&Self::Tensor], axis: usize) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Concat { axis }, xs)
    }

    fn slice(
        &self,
        x: &Self::Tensor,
        axis: usize,
        start: usize,
        end: usize,
    ) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Slice { axis, start, end }, &[x])
    }

    fn reduce_sum(&self, x: &Self::Tensor, axis: usize) -> Result<Self::Tensor, Error> {
        self.apply1(
            Op::Reduce {
                kind: ReduceKind::Sum,
                axis,
            },
            &[x],
        )
    }

    fn reduce_max(&self, x: &Self::Tensor, axis: usize) -> Result<Self::Tensor, Error> {
        self.apply1(
            Op::Reduce {
                kind: ReduceKind::Max,
                axis,
            },
            &[x],
        )
    }

    fn top_k(&self, x: &Self::Tensor, k: usize) -> Result<(Self::Tensor, Self::Tensor), Error> {
        let mut outputs = self.apply(Op::TopK { k }, &[x])?;
        match (outputs.pop(), outputs.pop()) {
            (Some(indices), Some(values)) if outputs.is_empty() => Ok((values, indices)),
            _ => Err(Error::shape("top_k", "expected (values, indices)")),
        }
    }

    fn gather(&self, data: &Self::Tensor, indices: &Self::Tensor) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Gather, &[data, indices])
    }

    fn select(
        &self,
        mask: &Self::Tensor,
        on_true: &Self::Tensor,
        on_false: &Self::Tensor,
    ) -> Result<Self::Tensor, Error> {
        self.apply1(Op::Select, &[mask, on_true, on_false])
    }

    fn deformable_aggregation(
        &self,
        feature: &Self::Tensor,
        spatial_shapes: &Self::Tensor,
        level_start_index: &Self::Tensor,
        sampling_location: &Self::Tensor,
        weights: &Self::Tensor,
    ) -> Result<Self::Tensor, Error> {
        self.apply1(
            Op::DeformableAggregation,
            &[
                feature,
                spatial_shapes,
                level_start_index,
                sampling_location,
                weights,
            ],
        )
    }
}
