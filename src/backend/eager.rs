use super::{kernels, Backend, Op};
use crate::error::Error;
use crate::tensor::{TensorMeta, Value};

/// Evaluates every op immediately on host ndarrays.
#[derive(Debug, Default, Clone, Copy)]
pub struct Eager;

impl Backend for Eager {
    type Tensor = Value;

    #[inline]
    fn meta(&self, tensor: &Value) -> TensorMeta {
        tensor.meta()
    }

    #[inline]
    fn constant(&self, value: Value) -> Result<Value, Error> {
        Ok(value)
    }

    #[inline]
    fn apply(&self, op: Op, inputs: &[&Value]) -> Result<Vec<Value>, Error> {
        kernels::eval(&op, inputs)
    }
}
