//! The training loop.
//!
//! A fit runs the forward and backward graph once per dataset row, sums the
//! parameter gradients over a logical batch and applies one optimizer step
//! per batch. The trailing shards of the dataset are held out for
//! validation and never shuffled.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, trace, warn};

use gr_runtime::Runtime;
use gr_tensor::{build_backward, ComputeGraph, ContextMark, OpKind, Role, TensorError, TensorId};

use crate::dataset::Dataset;
use crate::error::{Result, TrainError};
use crate::optimizer::{Optimizer, OptimizerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    /// Mean of the squared differences between output and labels.
    MeanSquaredError,
    /// Mean of the output; labels are ignored.
    Mean,
    /// Sum of the output; labels are ignored.
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitConfig {
    pub loss: LossKind,
    pub optimizer: OptimizerConfig,
    pub epochs: usize,
    /// Rows per logical batch, i.e. per optimizer step.
    pub batch_size: usize,
    /// Fraction of shards held out for validation, in `[0, 1)`.
    pub validation_fraction: f64,
    /// Shuffle the order of training shards every epoch.
    pub shuffle: bool,
    pub seed: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            loss: LossKind::MeanSquaredError,
            optimizer: OptimizerConfig::default(),
            epochs: 1,
            batch_size: 1,
            validation_fraction: 0.0,
            shuffle: true,
            seed: 0,
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(TrainError::InvalidConfig(
                "epochs and batch size must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(TrainError::InvalidConfig(format!(
                "validation fraction must be in [0, 1), got {}",
                self.validation_fraction
            )));
        }
        self.optimizer.validate()
    }
}

/// Where a fit currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitPhase {
    Idle,
    Shuffling,
    BatchIterate,
    ForwardBackward,
    OptimizerStep,
    EpochDone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    /// Standard error of `train_loss`.
    pub train_uncertainty: f64,
    pub val_loss: Option<f64>,
    pub val_uncertainty: Option<f64>,
    /// Training rows seen this epoch.
    pub rows: usize,
    /// Optimizer steps taken this epoch.
    pub steps: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub epochs: Vec<EpochReport>,
    /// Trained value of every parameter, by name.
    pub parameters: Vec<(String, Vec<f64>)>,
}

impl FitReport {
    pub fn parameter(&self, name: &str) -> Option<&[f64]> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn last_epoch(&self) -> Option<&EpochReport> {
        self.epochs.last()
    }
}

#[derive(Debug, Default)]
struct LossStats {
    sum: f64,
    sum_sq: f64,
    n: usize,
}

impl LossStats {
    fn push(&mut self, loss: f64) {
        self.sum += loss;
        self.sum_sq += loss * loss;
        self.n += 1;
    }

    fn mean(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum / self.n as f64
    }

    /// Standard error of the mean; zero below two samples.
    fn uncertainty(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        let n = self.n as f64;
        let var = (self.sum_sq / n - self.mean() * self.mean()).max(0.0);
        (var / (n - 1.0)).sqrt()
    }
}

/// Label, loss and gradient tensors appended to the model for one fit.
#[derive(Debug)]
struct TrainingGraph {
    label: TensorId,
    loss: TensorId,
    graph: ComputeGraph,
    // (parameter, gradient)
    params: Vec<(TensorId, TensorId)>,
}

impl TrainingGraph {
    fn declare(rt: &mut Runtime, output: TensorId, kind: LossKind) -> Result<Self> {
        let ctx = rt.ctx_mut();
        let out_t = ctx.tensor(output)?;
        let (shape, dtype) = (out_t.shape().clone(), out_t.dtype());

        let label = ctx.declare_tensor(shape, dtype, Role::Input)?;
        ctx.set_name(label, "label")?;
        let loss = match kind {
            LossKind::MeanSquaredError => {
                let diff = ctx.connect(OpKind::Sub, &[output, label])?;
                let sq = ctx.connect(OpKind::Sqr, &[diff])?;
                ctx.connect(OpKind::Mean, &[sq])?
            }
            LossKind::Mean => ctx.connect(OpKind::Mean, &[output])?,
            LossKind::Sum => ctx.connect(OpKind::Sum, &[output])?,
        };
        ctx.set_name(loss, "loss")?;
        ctx.set_role(loss, Role::Output)?;

        let forward = ComputeGraph::build(ctx, &[loss])?;
        let grads = build_backward(ctx, &forward, loss)?;
        for &leaf in forward.leafs() {
            let t = ctx.tensor(leaf)?;
            if t.role() == Role::Parameter && grads.grad(leaf).is_none() {
                warn!(parameter = t.name(), "parameter receives no gradient");
            }
        }
        let params = grads.params().to_vec();
        if params.is_empty() {
            return Err(TrainError::MissingGradient(
                ctx.tensor(output)?.name().to_string(),
            ));
        }

        rt.alloc_tensors(&[label, grads.seed])?;
        rt.write_f64(grads.seed, &[1.0])?;
        rt.plan(&grads.graph)?;
        Ok(TrainingGraph {
            label,
            loss,
            graph: grads.graph,
            params,
        })
    }
}

/// A fit in progress over one runtime.
///
/// Construction extends the runtime's context with the label, loss and
/// gradient tensors and plans the combined graph. The runtime's current
/// graph is left alone, so `Runtime::forward` keeps evaluating the model.
/// Dropping the fitter drops those tensors again and releases their
/// memory; trained parameter values stay in place.
#[derive(Debug)]
pub struct Fitter<'rt> {
    rt: &'rt mut Runtime,
    config: FitConfig,
    phase: FitPhase,
    // context state before the training tensors were declared
    mark: ContextMark,
    input: TensorId,
    train: TrainingGraph,
}

impl<'rt> Fitter<'rt> {
    /// Prepares a fit of the model `input -> output` held by `rt`.
    ///
    /// Leaves of the model that have no memory yet are placed statically
    /// first. Fails with `InvalidConfig` for a bad `config` or an `input`
    /// that is not a non-parameter leaf, and with `MissingGradient` if no
    /// parameter influences `output`. On failure the context is left as it
    /// was.
    pub fn new(
        rt: &'rt mut Runtime,
        input: TensorId,
        output: TensorId,
        config: FitConfig,
    ) -> Result<Self> {
        config.validate()?;
        let input_t = rt.ctx().tensor(input)?;
        if !input_t.is_leaf() || input_t.role() == Role::Parameter {
            return Err(TrainError::InvalidConfig(format!(
                "'{}' cannot be used as the model input",
                input_t.name()
            )));
        }
        rt.alloc_static()?;

        let mark = rt.mark();
        let train = match TrainingGraph::declare(rt, output, config.loss) {
            Ok(train) => train,
            Err(e) => {
                if let Err(cleanup) = rt.rewind(mark) {
                    warn!(error = %cleanup, "failed to release training tensors");
                }
                return Err(e);
            }
        };
        Ok(Fitter {
            rt,
            config,
            phase: FitPhase::Idle,
            mark,
            input,
            train,
        })
    }

    /// Where the fit currently is; `Idle` outside of `run`.
    pub fn phase(&self) -> FitPhase {
        self.phase
    }

    /// The scalar loss tensor. Valid only while the fitter is alive.
    pub fn loss(&self) -> TensorId {
        self.train.loss
    }

    /// The label tensor fed with each row's labels.
    pub fn label(&self) -> TensorId {
        self.train.label
    }

    fn transition(&mut self, next: FitPhase) {
        trace!(from = ?self.phase, to = ?next, "fit phase");
        self.phase = next;
    }

    /// Trains on `dataset` for the configured number of epochs.
    ///
    /// The dataset's feature and label widths must match the input and
    /// output tensors (`ShapeMismatch` otherwise). An error aborts the fit;
    /// updates already applied are kept.
    pub fn run(&mut self, dataset: &Dataset) -> Result<FitReport> {
        let ctx = self.rt.ctx();
        let (ne_in, ne_out) = (
            ctx.tensor(self.input)?.shape().numel(),
            ctx.tensor(self.train.label)?.shape().numel(),
        );
        if dataset.ne_feature() != ne_in || dataset.ne_label() != ne_out {
            return Err(TensorError::ShapeMismatch {
                op: "fit".to_string(),
                expected: vec![ne_in, ne_out],
                got: vec![dataset.ne_feature(), dataset.ne_label()],
            }
            .into());
        }

        let nshards = dataset.nshards();
        let n_train = ((nshards as f64 * (1.0 - self.config.validation_fraction)).floor() as usize)
            .clamp(1, nshards);
        let mut order: Vec<usize> = (0..n_train).collect();
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let sizes = self
            .train
            .params
            .iter()
            .map(|&(p, _)| Ok(self.rt.ctx().tensor(p)?.shape().numel()))
            .collect::<Result<Vec<usize>>>()?;
        let mut optimizer = Optimizer::new(self.config.optimizer, &sizes)?;

        let mut epochs = Vec::with_capacity(self.config.epochs);
        for epoch in 0..self.config.epochs {
            self.transition(FitPhase::Shuffling);
            if self.config.shuffle {
                order.shuffle(&mut rng);
            }

            self.transition(FitPhase::BatchIterate);
            let mut train = LossStats::default();
            let mut steps = 0;
            for &shard in &order {
                for row in dataset.shard_rows(shard) {
                    self.transition(FitPhase::ForwardBackward);
                    let loss = self.eval_row(dataset, row)?;
                    train.push(loss);
                    optimizer.accumulate(&self.gradients()?)?;

                    if optimizer.pending() == self.config.batch_size {
                        self.apply_step(&mut optimizer)?;
                        steps += 1;
                    }
                    self.transition(FitPhase::BatchIterate);
                }
            }
            if optimizer.pending() > 0 {
                self.apply_step(&mut optimizer)?;
                steps += 1;
            }

            let mut val = LossStats::default();
            for shard in n_train..nshards {
                for row in dataset.shard_rows(shard) {
                    val.push(self.eval_row(dataset, row)?);
                }
            }

            self.transition(FitPhase::EpochDone);
            let report = EpochReport {
                epoch,
                train_loss: train.mean(),
                train_uncertainty: train.uncertainty(),
                val_loss: (val.n > 0).then(|| val.mean()),
                val_uncertainty: (val.n > 0).then(|| val.uncertainty()),
                rows: train.n,
                steps,
            };
            info!(
                epoch,
                train_loss = report.train_loss,
                train_uncertainty = report.train_uncertainty,
                val_loss = ?report.val_loss,
                rows = report.rows,
                steps = report.steps,
                "epoch done"
            );
            epochs.push(report);
        }
        self.transition(FitPhase::Idle);

        let mut parameters = Vec::with_capacity(self.train.params.len());
        for &(p, _) in &self.train.params {
            let name = self.rt.ctx().tensor(p)?.name().to_string();
            parameters.push((name, self.rt.read_f64(p)?));
        }
        Ok(FitReport { epochs, parameters })
    }

    /// Loads one row, runs forward and backward, returns the loss.
    fn eval_row(&mut self, dataset: &Dataset, row: usize) -> Result<f64> {
        let ctx = self.rt.ctx();
        let in_dtype = ctx.tensor(self.input)?.dtype();
        let label_dtype = ctx.tensor(self.train.label)?.dtype();
        self.rt
            .write_bytes(self.input, &dataset.feature_bytes(row, in_dtype)?)?;
        self.rt
            .write_bytes(self.train.label, &dataset.label_bytes(row, label_dtype)?)?;
        self.rt.compute(&self.train.graph)?;
        let loss = self.rt.read_f64(self.train.loss)?;
        match loss.first() {
            Some(&v) => Ok(v),
            None => Err(TensorError::NoData("loss".to_string()).into()),
        }
    }

    fn gradients(&self) -> Result<Vec<Vec<f64>>> {
        self.train
            .params
            .iter()
            .map(|&(_, g)| Ok(self.rt.read_f64(g)?))
            .collect()
    }

    fn apply_step(&mut self, optimizer: &mut Optimizer) -> Result<()> {
        self.transition(FitPhase::OptimizerStep);
        let mut values = Vec::with_capacity(self.train.params.len());
        for &(p, _) in &self.train.params {
            values.push(self.rt.read_f64(p)?);
        }
        optimizer.step(&mut values)?;
        for (&(p, _), v) in self.train.params.iter().zip(&values) {
            self.rt.write_f64(p, v)?;
        }
        Ok(())
    }
}

/// Trains the model `input -> output` held by `rt` on `dataset`.
///
/// The training tensors exist only for the duration of the call; afterwards
/// `rt` holds the trained parameters and its current graph is unchanged.
pub fn fit(
    rt: &mut Runtime,
    input: TensorId,
    output: TensorId,
    dataset: &Dataset,
    config: &FitConfig,
) -> Result<FitReport> {
    let mut fitter = Fitter::new(rt, input, output, *config)?;
    fitter.run(dataset)
}

impl Drop for Fitter<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.rt.rewind(self.mark) {
            warn!(error = %e, "failed to release training tensors");
        }
    }
}
