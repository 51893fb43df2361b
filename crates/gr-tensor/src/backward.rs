//! Reverse-mode gradient graphs.
//!
//! Gradients are ordinary operation edges appended to the same context, so
//! they are scheduled, allocated and executed exactly like the forward pass.

use std::collections::{HashMap, HashSet};

use crate::context::{Context, Role, TensorId};
use crate::error::{Result, TensorError};
use crate::graph::ComputeGraph;
use crate::op::OpKind;

/// The forward graph extended with gradient edges.
#[derive(Debug, Clone)]
pub struct Gradients {
    /// Forward nodes followed by gradient nodes; outputs are the loss and
    /// every parameter gradient.
    pub graph: ComputeGraph,
    /// Constant holding d(loss)/d(loss); must be set to one before running.
    pub seed: TensorId,
    params: Vec<(TensorId, TensorId)>,
}

impl Gradients {
    /// `(parameter, gradient)` pairs for every parameter reachable from the loss.
    pub fn params(&self) -> &[(TensorId, TensorId)] {
        &self.params
    }

    pub fn grad(&self, param: TensorId) -> Option<TensorId> {
        self.params
            .iter()
            .find(|(p, _)| *p == param)
            .map(|&(_, g)| g)
    }
}

/// Appends the gradient edges of `loss` with respect to every parameter in
/// `forward`.
pub fn build_backward(
    ctx: &mut Context,
    forward: &ComputeGraph,
    loss: TensorId,
) -> Result<Gradients> {
    let loss_t = ctx.tensor(loss)?;
    if loss_t.shape().numel() != 1 {
        return Err(TensorError::ShapeMismatch {
            op: "backward".to_string(),
            expected: vec![1],
            got: loss_t.shape().dims().to_vec(),
        });
    }
    let loss_shape = loss_t.shape().clone();
    let loss_dtype = loss_t.dtype();

    let mut forward = forward.clone();
    forward.expand(ctx, loss)?;

    // Tensors whose value depends on some parameter.
    let mut needs_grad: HashSet<TensorId> = forward
        .leafs()
        .iter()
        .copied()
        .filter(|&id| matches!(ctx.tensor(id).map(|t| t.role()), Ok(Role::Parameter)))
        .collect();
    for &id in forward.nodes() {
        if ctx.tensor(id)?.src().iter().any(|s| needs_grad.contains(s)) {
            needs_grad.insert(id);
        }
    }

    let seed = ctx.declare_tensor(loss_shape, loss_dtype, Role::Constant)?;
    ctx.set_name(seed, "grad_seed")?;

    let mut grads: HashMap<TensorId, TensorId> = HashMap::new();
    grads.insert(loss, seed);

    for &id in forward.nodes().iter().rev() {
        let Some(&gc) = grads.get(&id) else {
            continue;
        };
        let node = ctx.tensor(id)?;
        let (op, param, src) = match node.op() {
            Some(op) => (op, node.param(), node.src().to_vec()),
            None => continue,
        };
        let wants = |i: usize| needs_grad.contains(&src[i]);

        match op {
            OpKind::Add => {
                for i in 0..2 {
                    if wants(i) {
                        accumulate(ctx, &mut grads, src[i], gc)?;
                    }
                }
            }
            OpKind::Sub => {
                if wants(0) {
                    accumulate(ctx, &mut grads, src[0], gc)?;
                }
                if wants(1) {
                    let neg = ctx.scale(gc, -1.0)?;
                    accumulate(ctx, &mut grads, src[1], neg)?;
                }
            }
            OpKind::Mul => {
                if wants(0) {
                    let g = ctx.connect(OpKind::Mul, &[gc, src[1]])?;
                    accumulate(ctx, &mut grads, src[0], g)?;
                }
                if wants(1) {
                    let g = ctx.connect(OpKind::Mul, &[gc, src[0]])?;
                    accumulate(ctx, &mut grads, src[1], g)?;
                }
            }
            OpKind::MatMul => {
                if wants(0) {
                    let bt = ctx.connect(OpKind::Transpose, &[src[1]])?;
                    let g = ctx.connect(OpKind::MatMul, &[gc, bt])?;
                    accumulate(ctx, &mut grads, src[0], g)?;
                }
                if wants(1) {
                    let at = ctx.connect(OpKind::Transpose, &[src[0]])?;
                    let g = ctx.connect(OpKind::MatMul, &[at, gc])?;
                    accumulate(ctx, &mut grads, src[1], g)?;
                }
            }
            OpKind::Transpose => {
                if wants(0) {
                    let g = ctx.connect(OpKind::Transpose, &[gc])?;
                    accumulate(ctx, &mut grads, src[0], g)?;
                }
            }
            OpKind::Sqr => {
                if wants(0) {
                    let twice = ctx.scale(src[0], 2.0)?;
                    let g = ctx.connect(OpKind::Mul, &[gc, twice])?;
                    accumulate(ctx, &mut grads, src[0], g)?;
                }
            }
            OpKind::Scale => {
                if wants(0) {
                    let g = ctx.scale(gc, param)?;
                    accumulate(ctx, &mut grads, src[0], g)?;
                }
            }
            OpKind::Sum => {
                if wants(0) {
                    let g = ctx.connect(OpKind::Repeat, &[gc, src[0]])?;
                    accumulate(ctx, &mut grads, src[0], g)?;
                }
            }
            OpKind::Mean => {
                if wants(0) {
                    let n = ctx.tensor(src[0])?.shape().numel() as f64;
                    let scaled = ctx.scale(gc, 1.0 / n)?;
                    let g = ctx.connect(OpKind::Repeat, &[scaled, src[0]])?;
                    accumulate(ctx, &mut grads, src[0], g)?;
                }
            }
            OpKind::Repeat => {
                if wants(0) {
                    let g = ctx.connect(OpKind::Sum, &[gc])?;
                    accumulate(ctx, &mut grads, src[0], g)?;
                }
            }
        }
    }

    let mut graph = forward;
    let mut params = Vec::new();
    for &leaf in graph.leafs().to_vec().iter() {
        if ctx.tensor(leaf)?.role() != Role::Parameter {
            continue;
        }
        if let Some(&g) = grads.get(&leaf) {
            if !ctx.tensor(g)?.is_leaf() {
                ctx.set_role(g, Role::Output)?;
            }
            params.push((leaf, g));
        }
    }
    for &(_, g) in &params {
        graph.expand(ctx, g)?;
    }

    Ok(Gradients {
        graph,
        seed,
        params,
    })
}

fn accumulate(
    ctx: &mut Context,
    grads: &mut HashMap<TensorId, TensorId>,
    target: TensorId,
    contribution: TensorId,
) -> Result<()> {
    let total = match grads.get(&target) {
        Some(&existing) => ctx.connect(OpKind::Add, &[existing, contribution])?,
        None => contribution,
    };
    grads.insert(target, total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::dtype::DType;
    use approx::assert_relative_eq;

    fn eager() -> Context {
        Context::new(ContextParams::default())
    }

    #[test]
    fn test_linear_gradients() {
        // loss = mean((a*x + b - y)^2)
        let mut ctx = eager();
        let a = ctx.declare_tensor([1], DType::F64, Role::Parameter).unwrap();
        let b = ctx.declare_tensor([1], DType::F64, Role::Parameter).unwrap();
        let x = ctx.declare_tensor([1], DType::F64, Role::Input).unwrap();
        let y = ctx.declare_tensor([1], DType::F64, Role::Input).unwrap();
        let ax = ctx.connect(OpKind::Mul, &[a, x]).unwrap();
        let pred = ctx.connect(OpKind::Add, &[ax, b]).unwrap();
        let diff = ctx.connect(OpKind::Sub, &[pred, y]).unwrap();
        let sq = ctx.connect(OpKind::Sqr, &[diff]).unwrap();
        let loss = ctx.connect(OpKind::Mean, &[sq]).unwrap();

        let forward = ComputeGraph::build(&ctx, &[loss]).unwrap();
        let grads = build_backward(&mut ctx, &forward, loss).unwrap();
        assert_eq!(grads.params().len(), 2);

        ctx.set_values(a, &[2.0f64]).unwrap();
        ctx.set_values(b, &[1.0f64]).unwrap();
        ctx.set_values(x, &[3.0f64]).unwrap();
        ctx.set_values(y, &[10.0f64]).unwrap();
        ctx.set_values(grads.seed, &[1.0f64]).unwrap();
        ctx.compute(&grads.graph).unwrap();

        // pred = 7, diff = -3, dL/dpred = -6
        assert_relative_eq!(ctx.values::<f64>(loss).unwrap()[0], 9.0);
        let ga = ctx.values::<f64>(grads.grad(a).unwrap()).unwrap()[0];
        let gb = ctx.values::<f64>(grads.grad(b).unwrap()).unwrap()[0];
        assert_relative_eq!(ga, -18.0);
        assert_relative_eq!(gb, -6.0);
    }

    #[test]
    fn test_matmul_gradients() {
        // loss = sum(W @ x), dL/dW[i][j] = x[j]
        let mut ctx = eager();
        let w = ctx.declare_tensor([2, 3], DType::F32, Role::Parameter).unwrap();
        let x = ctx.declare_tensor([3, 1], DType::F32, Role::Input).unwrap();
        let wx = ctx.connect(OpKind::MatMul, &[w, x]).unwrap();
        let loss = ctx.connect(OpKind::Sum, &[wx]).unwrap();
        let forward = ComputeGraph::build(&ctx, &[loss]).unwrap();
        let grads = build_backward(&mut ctx, &forward, loss).unwrap();

        ctx.set_values(w, &[1.0f32; 6]).unwrap();
        ctx.set_values(x, &[1.0f32, 2.0, 3.0]).unwrap();
        ctx.set_values(grads.seed, &[1.0f32]).unwrap();
        ctx.compute(&grads.graph).unwrap();

        let gw = ctx.values::<f32>(grads.grad(w).unwrap()).unwrap();
        assert_eq!(gw, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_shared_input_accumulates() {
        // loss = sum(a * a) -> dL/da = 2a
        let mut ctx = eager();
        let a = ctx.declare_tensor([2], DType::F32, Role::Parameter).unwrap();
        let sq = ctx.connect(OpKind::Mul, &[a, a]).unwrap();
        let loss = ctx.connect(OpKind::Sum, &[sq]).unwrap();
        let forward = ComputeGraph::build(&ctx, &[loss]).unwrap();
        let grads = build_backward(&mut ctx, &forward, loss).unwrap();

        ctx.set_values(a, &[1.5f32, -2.0]).unwrap();
        ctx.set_values(grads.seed, &[1.0f32]).unwrap();
        ctx.compute(&grads.graph).unwrap();
        assert_eq!(ctx.values::<f32>(grads.grad(a).unwrap()).unwrap(), vec![3.0, -4.0]);
    }

    #[test]
    fn test_inputs_get_no_gradient() {
        let mut ctx = eager();
        let a = ctx.declare_tensor([1], DType::F32, Role::Parameter).unwrap();
        let x = ctx.declare_tensor([1], DType::F32, Role::Input).unwrap();
        let ax = ctx.connect(OpKind::Mul, &[a, x]).unwrap();
        let forward = ComputeGraph::build(&ctx, &[ax]).unwrap();
        let grads = build_backward(&mut ctx, &forward, ax).unwrap();
        assert!(grads.grad(x).is_none());
        assert!(grads.grad(a).is_some());
        let g = grads.grad(a).unwrap();
        assert_eq!(ctx.tensor(g).unwrap().role(), Role::Output);
    }

    #[test]
    fn test_non_scalar_loss_rejected() {
        let mut ctx = eager();
        let a = ctx.declare_tensor([2], DType::F32, Role::Parameter).unwrap();
        let sq = ctx.connect(OpKind::Sqr, &[a]).unwrap();
        let forward = ComputeGraph::build(&ctx, &[sq]).unwrap();
        assert!(matches!(
            build_backward(&mut ctx, &forward, sq),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}
