//! Linear regression `y = a * x + b`, the smallest model that exercises
//! the whole stack.

use gr_runtime::Runtime;
use gr_tensor::{Backend, ComputeGraph, Context, ContextParams, DType, OpKind, Role, TensorId};

use crate::dataset::Dataset;
use crate::error::Result;
use crate::fit::{fit, FitConfig, FitReport};

/// Declares `a`, `b`, `x` and `y = a * x + b` in `ctx`.
fn declare_line(ctx: &mut Context) -> Result<[TensorId; 4]> {
    let a = ctx.declare_tensor([1], DType::F32, Role::Parameter)?;
    ctx.set_name(a, "a")?;
    let b = ctx.declare_tensor([1], DType::F32, Role::Parameter)?;
    ctx.set_name(b, "b")?;
    let x = ctx.declare_tensor([1], DType::F32, Role::Input)?;
    ctx.set_name(x, "x")?;
    let ax = ctx.connect(OpKind::Mul, &[a, x])?;
    let y = ctx.connect(OpKind::Add, &[ax, b])?;
    ctx.set_name(y, "y")?;
    ctx.set_role(y, Role::Output)?;
    Ok([a, b, x, y])
}

/// Regression evaluated eagerly on the host, inside an allocating context.
#[derive(Debug)]
pub struct EagerRegression {
    ctx: Context,
    a: TensorId,
    b: TensorId,
    x: TensorId,
    y: TensorId,
    graph: ComputeGraph,
}

impl EagerRegression {
    pub fn new() -> Result<Self> {
        let mut ctx = Context::new(ContextParams {
            mem_size: 64 * 1024,
            no_alloc: false,
        });
        let [a, b, x, y] = declare_line(&mut ctx)?;
        let graph = ComputeGraph::build(&ctx, &[y])?;
        Ok(EagerRegression {
            ctx,
            a,
            b,
            x,
            y,
            graph,
        })
    }

    pub fn set_params(&mut self, a: f32, b: f32) -> Result<()> {
        self.ctx.set_values(self.a, &[a])?;
        self.ctx.set_values(self.b, &[b])?;
        Ok(())
    }

    pub fn params(&self) -> Result<(f32, f32)> {
        Ok((self.ctx.values::<f32>(self.a)?[0], self.ctx.values::<f32>(self.b)?[0]))
    }

    pub fn forward(&mut self, x: f32) -> Result<f32> {
        self.ctx.set_values(self.x, &[x])?;
        self.ctx.compute(&self.graph)?;
        Ok(self.ctx.values::<f32>(self.y)?[0])
    }
}

/// What a [`BackendRegression`] was set up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    /// Backend names in priority order.
    pub backends: Vec<String>,
    /// Bytes of statically allocated parameters and inputs.
    pub static_bytes: usize,
}

/// Regression evaluated and trained through the backend scheduler.
#[derive(Debug)]
pub struct BackendRegression {
    rt: Runtime,
    x: TensorId,
    y: TensorId,
}

impl BackendRegression {
    /// `backends` in priority order; parameters live on the first one.
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Result<(Self, InitReport)> {
        let mut rt = Runtime::new(Context::deferred(1024 * 1024), backends)?;
        let [_, _, x, y] = declare_line(rt.ctx_mut())?;
        let static_bytes = rt.alloc_static()?;
        rt.build_graph(&[y])?;
        let report = InitReport {
            backends: rt.backend_names(),
            static_bytes,
        };
        Ok((BackendRegression { rt, x, y }, report))
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn set_params(&mut self, a: f32, b: f32) -> Result<()> {
        self.rt.set_parameter("a", &[a])?;
        self.rt.set_parameter("b", &[b])?;
        Ok(())
    }

    pub fn params(&self) -> Result<(f32, f32)> {
        Ok((
            self.rt.get_parameter::<f32>("a")?[0],
            self.rt.get_parameter::<f32>("b")?[0],
        ))
    }

    pub fn forward(&mut self, x: f32) -> Result<f32> {
        let out = self.rt.forward(&[(self.x, &[x][..])])?;
        Ok(out[0][0])
    }

    /// Fits `a` and `b` to `dataset`; rows are `(x, y)` pairs.
    pub fn train(&mut self, dataset: &Dataset, config: &FitConfig) -> Result<FitReport> {
        fit(&mut self.rt, self.x, self.y, dataset, config)
    }
}
