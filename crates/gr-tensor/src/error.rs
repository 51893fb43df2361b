use thiserror::Error;

use crate::dtype::DType;
use crate::op::OpKind;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("invalid shape {dims:?}: every dimension must be non-zero")]
    InvalidShape { dims: Vec<usize> },
    #[error("{op}: shape mismatch, expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        op: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("context exhausted: need {needed} bytes, {available} available")]
    ContextExhausted { needed: usize, available: usize },
    #[error("range of {len} bytes at offset {offset} out of bounds for {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("dtype mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: DType, got: DType },
    #[error("backend '{backend}' failed to allocate {size} bytes")]
    AllocationFailed { backend: String, size: usize },
    #[error("{op} takes {expected} operands, got {got}")]
    Arity {
        op: OpKind,
        expected: usize,
        got: usize,
    },
    #[error("execution of {op} failed: {reason}")]
    Execution { op: OpKind, reason: String },
    #[error("unknown tensor id {0}")]
    UnknownTensor(usize),
    #[error("unknown buffer id {0}")]
    UnknownBuffer(usize),
    #[error("tensor '{0}' has no data")]
    NoData(String),
    #[error("tensor '{tensor}' cannot take role {role}")]
    InvalidRole { tensor: String, role: String },
    #[error("context mode mismatch: {0}")]
    ModeMismatch(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;
