//! `gr-tensor` - Symbolic tensors, operation graphs and compute backends.
//!
//! This crate provides:
//! - A `Context` arena that owns tensors and the operation edges between them
//! - `ComputeGraph` topological plans and reverse-mode gradient graphs
//! - A `Backend` trait for pluggable compute (buffer management + kernels)
//! - A reference `CpuBackend` and a bounded, capability-limited `PooledBackend`
//! - Element types (F32, F64, F16) and host-side storage conversions

pub mod backend;
pub mod backward;
pub mod context;
pub mod cpu;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod op;
pub mod pool;
pub mod shape;
pub mod storage;

// Re-export primary types at the crate root for convenience.
pub use backend::{
    Backend, BackendId, BufferId, BufferRef, BufferSet, BufferType, Launch, TensorView,
};
pub use backward::{build_backward, Gradients};
pub use context::{Context, ContextMark, ContextParams, Role, TensorData, TensorId, TensorNode};
pub use cpu::CpuBackend;
pub use dtype::{DType, Element};
pub use error::{Result, TensorError};
pub use graph::ComputeGraph;
pub use op::OpKind;
pub use pool::PooledBackend;
pub use shape::Shape;
pub use storage::HostStorage;
