use thiserror::Error;

use gr_tensor::{OpKind, TensorError};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
    #[error("no backend supports {op} needed by tensor '{tensor}'")]
    NoCapableBackend { op: OpKind, tensor: String },
    #[error("backend '{backend}' failed to allocate {size} bytes (peak at tensor '{tensor}')")]
    AllocationFailed {
        backend: String,
        size: usize,
        tensor: String,
    },
    #[error("at least one backend is required")]
    EmptyBackendList,
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("tensor '{0}' is not resident on any backend")]
    NotResident(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
