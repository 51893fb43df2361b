//! `gr-runtime` - Graph memory planning and multi-backend execution.
//!
//! This crate provides:
//! - A `GraphAllocator` that reuses compute-buffer regions by liveness
//! - A `Scheduler` that assigns nodes to backends by capability and inserts
//!   cross-backend copies
//! - A `Runtime` facade tying a deferred context to a scheduler

pub mod allocator;
pub mod error;
pub mod runtime;
pub mod scheduler;

pub use allocator::{AllocationPlan, GraphAllocator, Placement};
pub use error::{Result, RuntimeError};
pub use runtime::Runtime;
pub use scheduler::{Scheduler, Split, TensorCopy};
