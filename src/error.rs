use thiserror::Error;

use crate::parallel::Device;
use crate::tensor::DType;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Shape Error in {op}: {detail}")]
    Shape { op: &'static str, detail: String },

    #[error("DType Error in {op}: expected {expected:?}, found {found:?}")]
    DType {
        op: &'static str,
        expected: DType,
        found: DType,
    },

    #[error("Index Error in {op}: index {index} out of range for axis of length {len}")]
    Index {
        op: &'static str,
        index: i64,
        len: usize,
    },

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Unknown operation `{0}` in operation order")]
    UnknownOperation(String),

    #[error("Head produced no {0}; the operation order must end with a refine stage")]
    MissingOutput(&'static str),

    #[error("Invalid Graph `{graph}`: {detail}")]
    InvalidGraph { graph: String, detail: String },

    #[error(
        "module must have its parameters and buffers on device {expected} (device_ids[0]) but found one of them on device: {found}"
    )]
    DevicePlacement { expected: Device, found: Device },

    #[error("Replication Error: {0}")]
    Replication(String),

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        Error::Shape {
            op,
            detail: detail.into(),
        }
    }
}
