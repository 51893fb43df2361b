use tracing::debug;

use gr_tensor::dtype::{convert, decode, encode};
use gr_tensor::{
    Backend, ComputeGraph, Context, ContextMark, DType, Element, Role, TensorError, TensorId,
};

use crate::error::{Result, RuntimeError};
use crate::scheduler::Scheduler;

/// A deferred context bound to a scheduler, plus the graph currently in use.
///
/// The current graph is the one `forward` evaluates. It is set by
/// `build_graph` or `alloc_graph`; other graphs can be planned and computed
/// through the same runtime without replacing it.
#[derive(Debug)]
pub struct Runtime {
    ctx: Context,
    sched: Scheduler,
    graph: Option<ComputeGraph>,
}

impl Runtime {
    /// Creates a runtime over `ctx` and `backends`.
    ///
    /// `ctx` must be deferred (`ModeMismatch` otherwise); `backends` are in
    /// priority order and must not be empty.
    pub fn new(ctx: Context, backends: Vec<Box<dyn Backend>>) -> Result<Self> {
        if ctx.is_allocating() {
            return Err(TensorError::ModeMismatch(
                "a runtime needs a deferred context".to_string(),
            )
            .into());
        }
        Ok(Runtime {
            ctx,
            sched: Scheduler::new(backends)?,
            graph: None,
        })
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Mutable access for declaring tensors and connecting operations.
    pub fn ctx_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.sched
    }

    /// Names of the backends in priority order.
    pub fn backend_names(&self) -> Vec<String> {
        self.sched.backend_names()
    }

    /// Places every leaf that has no data yet on the primary backend.
    ///
    /// Returns the bytes reserved; leaves that are already placed are left
    /// alone, so calling this again after declaring more leaves is cheap.
    pub fn alloc_static(&mut self) -> Result<usize> {
        let pending: Vec<TensorId> = self
            .ctx
            .ids()
            .filter(|&id| {
                self.ctx
                    .tensor(id)
                    .map(|t| t.is_leaf() && t.data().is_none())
                    .unwrap_or(false)
            })
            .collect();
        self.alloc_tensors(&pending)
    }

    /// Places `tensors` contiguously on the primary backend and returns the
    /// bytes reserved.
    pub fn alloc_tensors(&mut self, tensors: &[TensorId]) -> Result<usize> {
        if tensors.is_empty() {
            return Ok(0);
        }
        let bytes = self.sched.alloc_tensors(&mut self.ctx, tensors)?;
        debug!(tensors = tensors.len(), bytes, "static allocation");
        Ok(bytes)
    }

    /// Builds the graph producing `outputs` and makes it the current graph.
    ///
    /// Nothing is planned yet; the first `compute` or `forward` plans it.
    pub fn build_graph(&mut self, outputs: &[TensorId]) -> Result<ComputeGraph> {
        let graph = ComputeGraph::build(&self.ctx, outputs)?;
        self.graph = Some(graph.clone());
        Ok(graph)
    }

    /// The graph `forward` evaluates, if one has been built.
    pub fn graph(&self) -> Option<&ComputeGraph> {
        self.graph.as_ref()
    }

    /// Plans `graph` across the backends and makes it the current graph.
    ///
    /// Fails with `NoCapableBackend` or `AllocationFailed` before any
    /// kernel runs.
    pub fn alloc_graph(&mut self, graph: &ComputeGraph) -> Result<()> {
        self.plan(graph)?;
        self.graph = Some(graph.clone());
        Ok(())
    }

    /// Plans `graph` without making it the current graph.
    pub fn plan(&mut self, graph: &ComputeGraph) -> Result<()> {
        self.sched.plan(&mut self.ctx, graph)
    }

    /// Runs `graph` on the backends, replanning first if needed. The
    /// current graph is unchanged.
    pub fn compute(&mut self, graph: &ComputeGraph) -> Result<()> {
        self.sched.compute(&mut self.ctx, graph)
    }

    /// Writes `inputs`, runs the current graph and returns the value of each
    /// of its outputs, in the order they were passed to `build_graph`.
    pub fn forward<T: Element>(&mut self, inputs: &[(TensorId, &[T])]) -> Result<Vec<Vec<T>>> {
        for &(id, values) in inputs {
            self.set_values(id, values)?;
        }
        let Some(graph) = self.graph.as_ref() else {
            return Err(RuntimeError::Other("no graph has been built".to_string()));
        };
        self.sched.compute(&mut self.ctx, graph)?;
        graph
            .outputs()
            .iter()
            .map(|&out| read_values(&self.sched, &self.ctx, out))
            .collect()
    }

    /// Marks the current end of the context for a later [`Runtime::rewind`].
    pub fn mark(&self) -> ContextMark {
        self.ctx.mark()
    }

    /// Drops every tensor declared after `mark`.
    ///
    /// Compute buffers are released and so is every static allocation that
    /// holds one of the dropped tensors. The current graph is cleared if it
    /// refers to any of them.
    pub fn rewind(&mut self, mark: ContextMark) -> Result<()> {
        self.sched.release_after(&mut self.ctx, mark)?;
        let stale = self.graph.as_ref().is_some_and(|g| {
            g.nodes()
                .iter()
                .chain(g.leafs())
                .chain(g.outputs())
                .any(|&t| mark.is_after(t))
        });
        if stale {
            self.graph = None;
        }
        self.ctx.rewind(mark)?;
        Ok(())
    }

    /// Writes `values` into a tensor. Checks `T` against the tensor's dtype
    /// (`TypeMismatch`) and the element count (`ShapeMismatch`).
    pub fn set_values<T: Element>(&mut self, id: TensorId, values: &[T]) -> Result<()> {
        self.ctx.tensor(id)?.check_elements::<T>(values.len())?;
        self.sched.set_tensor(&self.ctx, id, 0, &encode(values))
    }

    /// Reads every element of a tensor as `T`, with the same checks as
    /// `set_values`.
    pub fn values<T: Element>(&self, id: TensorId) -> Result<Vec<T>> {
        read_values(&self.sched, &self.ctx, id)
    }

    /// Overwrites a whole tensor with raw little-endian bytes of its dtype.
    pub fn write_bytes(&mut self, id: TensorId, bytes: &[u8]) -> Result<()> {
        let t = self.ctx.tensor(id)?;
        if bytes.len() != t.nbytes() {
            return Err(TensorError::ShapeMismatch {
                op: format!("write '{}'", t.name()),
                expected: vec![t.nbytes()],
                got: vec![bytes.len()],
            }
            .into());
        }
        self.sched.set_tensor(&self.ctx, id, 0, bytes)
    }

    /// Reads a tensor of any graph dtype, widened to `f64`.
    pub fn read_f64(&self, id: TensorId) -> Result<Vec<f64>> {
        let t = self.ctx.tensor(id)?;
        let bytes = self.sched.get_tensor(&self.ctx, id, 0, t.nbytes())?;
        Ok(decode(&convert(&bytes, t.dtype(), DType::F64)))
    }

    /// Writes `f64` values into a tensor of any graph dtype.
    pub fn write_f64(&mut self, id: TensorId, values: &[f64]) -> Result<()> {
        let dtype = self.ctx.tensor(id)?.dtype();
        self.write_bytes(id, &convert(&encode(values), DType::F64, dtype))
    }

    /// Writes the parameter called `name`; `UnknownParameter` if there is
    /// no such tensor or it is not a parameter.
    pub fn set_parameter<T: Element>(&mut self, name: &str, values: &[T]) -> Result<()> {
        let id = self.parameter(name)?;
        self.set_values(id, values)
    }

    /// Reads the parameter called `name`.
    pub fn get_parameter<T: Element>(&self, name: &str) -> Result<Vec<T>> {
        self.values(self.parameter(name)?)
    }

    /// Id of the parameter tensor called `name`.
    pub fn parameter(&self, name: &str) -> Result<TensorId> {
        self.ctx
            .find(name)
            .filter(|&id| matches!(self.ctx.tensor(id).map(|t| t.role()), Ok(Role::Parameter)))
            .ok_or_else(|| RuntimeError::UnknownParameter(name.to_string()))
    }
}

fn read_values<T: Element>(sched: &Scheduler, ctx: &Context, id: TensorId) -> Result<Vec<T>> {
    let t = ctx.tensor(id)?;
    t.check_elements::<T>(t.shape().numel())?;
    Ok(decode(&sched.get_tensor(ctx, id, 0, t.nbytes())?))
}
