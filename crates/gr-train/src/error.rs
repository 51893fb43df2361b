use thiserror::Error;

use gr_runtime::RuntimeError;
use gr_tensor::TensorError;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("dataset has no rows")]
    EmptyDataset,
    #[error("no gradient reaches parameter '{0}'")]
    MissingGradient(String),
}

pub type Result<T> = std::result::Result<T, TrainError>;
