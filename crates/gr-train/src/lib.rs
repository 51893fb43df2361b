//! `gr-train` - Datasets, optimizers and the fit loop on top of `gr-runtime`.
//!
//! This crate provides:
//! - A `DataLoader` producing sharded, host-resident `Dataset`s
//! - `AdamW` and `Sgd` optimizers with gradient accumulation
//! - The `fit` training loop with a shuffled train / fixed validation split
//! - Eager and backend-driven linear regression models

pub mod dataset;
pub mod error;
pub mod fit;
pub mod optimizer;
pub mod regression;

pub use dataset::{DataLoader, Dataset};
pub use error::{Result, TrainError};
pub use fit::{fit, EpochReport, FitConfig, FitPhase, FitReport, Fitter, LossKind};
pub use optimizer::{Optimizer, OptimizerConfig, OptimizerKind};
pub use regression::{BackendRegression, EagerRegression, InitReport};
