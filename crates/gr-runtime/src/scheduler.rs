//! Multi-backend scheduling.
//!
//! Each graph node runs on the first backend (in priority order) that
//! supports its operator and dtype. Consecutive nodes on the same backend
//! form a split; inputs living on another backend are mirrored into a copy
//! buffer of the split's backend before the split runs.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use gr_tensor::context::align_up;
use gr_tensor::{
    Backend, BackendId, BufferId, BufferRef, BufferSet, ComputeGraph, Context, ContextMark, Launch,
    TensorData, TensorError, TensorId, TensorView,
};

use crate::allocator::{AllocationPlan, GraphAllocator};
use crate::error::{Result, RuntimeError};

/// Transfer of one tensor into a mirror on another backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorCopy {
    pub tensor: TensorId,
    pub src: BufferRef,
    pub dst: BufferRef,
    pub nbytes: usize,
}

/// A maximal run of consecutive graph nodes assigned to one backend.
#[derive(Debug, Clone)]
pub struct Split {
    pub backend: BackendId,
    pub nodes: Vec<TensorId>,
    /// Copies performed before the split's launches.
    pub copies: Vec<TensorCopy>,
    launches: Vec<Launch>,
}

impl Split {
    pub fn launches(&self) -> &[Launch] {
        &self.launches
    }
}

#[derive(Debug)]
struct SchedulePlan {
    nodes: Vec<TensorId>,
    // placements of the leaves at planning time
    leafs: Vec<(TensorId, Option<TensorData>)>,
    splits: Vec<Split>,
    allocations: Vec<AllocationPlan>,
}

/// Ordered backends (primary first) and the plan of the last graph.
#[derive(Debug)]
pub struct Scheduler {
    backends: Vec<Box<dyn Backend>>,
    allocators: Vec<GraphAllocator>,
    copy_buffers: Vec<(BackendId, BufferId)>,
    statics: Vec<BufferSet>,
    plan: Option<SchedulePlan>,
}

impl Scheduler {
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(RuntimeError::EmptyBackendList);
        }
        let allocators = backends
            .iter()
            .map(|b| GraphAllocator::new(b.buffer_type()))
            .collect();
        Ok(Scheduler {
            backends,
            allocators,
            copy_buffers: Vec::new(),
            statics: Vec::new(),
            plan: None,
        })
    }

    /// Names of the backends in priority order.
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn n_backends(&self) -> usize {
        self.backends.len()
    }

    pub fn backend(&self, id: BackendId) -> Option<&dyn Backend> {
        self.backends.get(id.0).map(|b| b.as_ref())
    }

    /// Bytes held by statically allocated tensors across all backends.
    pub fn static_bytes(&self) -> usize {
        self.statics.iter().map(|s| s.size).sum()
    }

    /// Statically allocates `tensors` on the primary backend.
    pub fn alloc_tensors(&mut self, ctx: &mut Context, tensors: &[TensorId]) -> Result<usize> {
        self.alloc_tensors_on(BackendId(0), ctx, tensors)
    }

    /// Statically allocates `tensors` on `id`; returns the bytes reserved.
    pub fn alloc_tensors_on(
        &mut self,
        id: BackendId,
        ctx: &mut Context,
        tensors: &[TensorId],
    ) -> Result<usize> {
        let backend = backend_at(&mut self.backends, id)?;
        let set = backend.allocate(id, ctx, tensors)?;
        let size = set.size;
        self.statics.push(set);
        Ok(size)
    }

    /// Writes bytes into a tensor on whichever backend holds it.
    pub fn set_tensor(
        &mut self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let at = placement(ctx, tensor)?;
        let backend = backend_at(&mut self.backends, at.backend)?;
        backend.write(at.backend, ctx, tensor, offset, bytes)?;
        Ok(())
    }

    /// Reads bytes from a tensor on whichever backend holds it.
    pub fn get_tensor(
        &self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>> {
        let at = placement(ctx, tensor)?;
        let backend = self
            .backend(at.backend)
            .ok_or_else(|| RuntimeError::Other(format!("unknown backend {}", at.backend.0)))?;
        Ok(backend.read(at.backend, ctx, tensor, offset, len)?)
    }

    /// Splits of the current plan, in execution order.
    pub fn splits(&self) -> &[Split] {
        match &self.plan {
            Some(p) => &p.splits,
            None => &[],
        }
    }

    /// Per-backend memory plans of the current graph.
    pub fn allocations(&self) -> &[AllocationPlan] {
        match &self.plan {
            Some(p) => &p.allocations,
            None => &[],
        }
    }

    /// Backend a node of the current plan runs on.
    pub fn assignment(&self, tensor: TensorId) -> Option<BackendId> {
        self.splits()
            .iter()
            .find(|s| s.nodes.contains(&tensor))
            .map(|s| s.backend)
    }

    /// Assigns, allocates and lowers `graph`, replacing any previous plan.
    pub fn plan(&mut self, ctx: &mut Context, graph: &ComputeGraph) -> Result<()> {
        self.reset(ctx)?;

        let mut location: HashMap<TensorId, BackendId> = HashMap::new();
        let mut leafs = Vec::with_capacity(graph.leafs().len());
        for &leaf in graph.leafs() {
            let at = placement(ctx, leaf)?;
            location.insert(leaf, at.backend);
            leafs.push((leaf, ctx.tensor(leaf)?.data()));
        }

        let mut assigned: Vec<(TensorId, BackendId)> = Vec::with_capacity(graph.len());
        for &id in graph.nodes() {
            let t = ctx.tensor(id)?;
            let op = t
                .op()
                .ok_or_else(|| RuntimeError::Other(format!("'{}' has no operator", t.name())))?;
            let b = self
                .backends
                .iter()
                .position(|b| b.supports(op, t.dtype()))
                .ok_or_else(|| RuntimeError::NoCapableBackend {
                    op,
                    tensor: t.name().to_string(),
                })?;
            location.insert(id, BackendId(b));
            assigned.push((id, BackendId(b)));
        }

        // producers read from another backend must survive until copied
        let mut pinned: HashSet<TensorId> = HashSet::new();
        for &(id, b) in &assigned {
            for src in ctx.tensor(id)?.src() {
                if location.get(src) != Some(&b) {
                    pinned.insert(*src);
                }
            }
        }

        let mut allocations = Vec::new();
        let mut failure = None;
        for (i, (alloc, backend)) in self
            .allocators
            .iter_mut()
            .zip(self.backends.iter_mut())
            .enumerate()
        {
            let nodes: Vec<TensorId> = assigned
                .iter()
                .filter(|(_, b)| b.0 == i)
                .map(|&(t, _)| t)
                .collect();
            if nodes.is_empty() {
                continue;
            }
            match alloc.alloc_graph(ctx, graph, &nodes, &pinned, BackendId(i), backend.as_mut()) {
                Ok(plan) => allocations.push(plan),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            self.reset(ctx)?;
            return Err(e);
        }

        // Group into splits and lay out mirrors per destination backend.
        let mut splits: Vec<Split> = Vec::new();
        let mut mirrored: Vec<Vec<TensorId>> = Vec::new();
        let mut mirrors: HashMap<(TensorId, BackendId), usize> = HashMap::new();
        let mut copy_sizes = vec![0usize; self.backends.len()];
        let mut first_mirror: Vec<Option<TensorId>> = vec![None; self.backends.len()];
        for &(id, b) in &assigned {
            if splits.last().map(|s| s.backend) != Some(b) {
                splits.push(Split {
                    backend: b,
                    nodes: Vec::new(),
                    copies: Vec::new(),
                    launches: Vec::new(),
                });
                mirrored.push(Vec::new());
            }
            let last = splits.len() - 1;
            splits[last].nodes.push(id);
            for &src in ctx.tensor(id)?.src() {
                let home = location
                    .get(&src)
                    .copied()
                    .ok_or_else(|| RuntimeError::NotResident(src.to_string()))?;
                if home == b || mirrors.contains_key(&(src, b)) {
                    continue;
                }
                let alignment = self.backends[b.0].buffer_type().alignment;
                let offset = align_up(copy_sizes[b.0], alignment);
                copy_sizes[b.0] = offset + ctx.tensor(src)?.nbytes();
                mirrors.insert((src, b), offset);
                mirrored[last].push(src);
                first_mirror[b.0].get_or_insert(src);
            }
        }

        let mut copy_buffer: Vec<Option<BufferId>> = vec![None; self.backends.len()];
        for (i, &size) in copy_sizes.iter().enumerate() {
            if size == 0 {
                continue;
            }
            let backend = self.backends[i].as_mut();
            match backend.alloc_buffer(size) {
                Ok(buf) => {
                    copy_buffer[i] = Some(buf);
                    self.copy_buffers.push((BackendId(i), buf));
                }
                Err(TensorError::AllocationFailed { .. }) => {
                    let tensor = first_mirror[i]
                        .and_then(|t| ctx.tensor(t).ok())
                        .map(|t| t.name().to_string())
                        .unwrap_or_default();
                    let err = RuntimeError::AllocationFailed {
                        backend: backend.name().to_string(),
                        size,
                        tensor,
                    };
                    self.reset(ctx)?;
                    return Err(err);
                }
                Err(e) => {
                    self.reset(ctx)?;
                    return Err(e.into());
                }
            }
        }

        let mut n_copies = 0;
        for (split, srcs) in splits.iter_mut().zip(mirrored) {
            let backend = split.backend;
            let mirror_of = |src: TensorId| -> Option<BufferRef> {
                let offset = *mirrors.get(&(src, backend))?;
                let buffer = copy_buffer[backend.0]?;
                Some(BufferRef {
                    backend,
                    buffer,
                    offset,
                })
            };
            let mut copies = Vec::with_capacity(srcs.len());
            for src in srcs {
                let dst = mirror_of(src).ok_or_else(|| RuntimeError::NotResident(src.to_string()))?;
                copies.push(TensorCopy {
                    tensor: src,
                    src: placement(ctx, src)?,
                    dst,
                    nbytes: ctx.tensor(src)?.nbytes(),
                });
            }
            let mut launches = Vec::with_capacity(split.nodes.len());
            for &id in &split.nodes {
                let t = ctx.tensor(id)?;
                let mut inputs = Vec::with_capacity(t.src().len());
                for &src in t.src() {
                    let at = match mirror_of(src) {
                        Some(at) => at,
                        None => placement(ctx, src)?,
                    };
                    inputs.push(view(ctx, src, at)?);
                }
                let op = t
                    .op()
                    .ok_or_else(|| RuntimeError::Other(format!("'{}' has no operator", t.name())))?;
                launches.push(Launch {
                    tensor: id,
                    op,
                    param: t.param(),
                    inputs,
                    output: view(ctx, id, placement(ctx, id)?)?,
                });
            }
            n_copies += copies.len();
            split.copies = copies;
            split.launches = launches;
        }

        debug!(
            nodes = graph.len(),
            splits = splits.len(),
            copies = n_copies,
            "scheduled graph"
        );
        self.plan = Some(SchedulePlan {
            nodes: graph.nodes().to_vec(),
            leafs,
            splits,
            allocations,
        });
        Ok(())
    }

    /// Runs `graph`, replanning first if it is not the graph last planned
    /// or a leaf has moved since.
    pub fn compute(&mut self, ctx: &mut Context, graph: &ComputeGraph) -> Result<()> {
        if !self.is_planned(ctx, graph)? {
            self.plan(ctx, graph)?;
        }
        let Some(plan) = self.plan.as_ref() else {
            return Err(RuntimeError::Other("graph is not planned".to_string()));
        };
        for split in &plan.splits {
            for copy in &split.copies {
                let bytes = backend_at(&mut self.backends, copy.src.backend)?.read_buffer(
                    copy.src.buffer,
                    copy.src.offset,
                    copy.nbytes,
                )?;
                backend_at(&mut self.backends, copy.dst.backend)?.write_buffer(
                    copy.dst.buffer,
                    copy.dst.offset,
                    &bytes,
                )?;
            }
            backend_at(&mut self.backends, split.backend)?.execute(&split.launches)?;
        }
        Ok(())
    }

    fn is_planned(&self, ctx: &Context, graph: &ComputeGraph) -> Result<bool> {
        let Some(plan) = &self.plan else {
            return Ok(false);
        };
        if plan.nodes != graph.nodes() {
            return Ok(false);
        }
        for &(leaf, data) in &plan.leafs {
            if ctx.tensor(leaf)?.data() != data {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Releases every compute and copy buffer and drops the plan. Static
    /// allocations are kept.
    pub fn reset(&mut self, ctx: &mut Context) -> Result<()> {
        for (alloc, backend) in self.allocators.iter_mut().zip(self.backends.iter_mut()) {
            alloc.release(ctx, backend.as_mut())?;
        }
        for (id, buffer) in self.copy_buffers.drain(..) {
            if let Some(backend) = self.backends.get_mut(id.0) {
                backend.free_buffer(buffer);
            }
        }
        self.plan = None;
        Ok(())
    }

    /// Resets the plan and releases every static allocation holding a
    /// tensor declared after `mark`, so those tensors can be rewound.
    pub fn release_after(&mut self, ctx: &mut Context, mark: ContextMark) -> Result<usize> {
        self.reset(ctx)?;
        let (released, kept): (Vec<BufferSet>, Vec<BufferSet>) = std::mem::take(&mut self.statics)
            .into_iter()
            .partition(|set| set.tensors.iter().any(|&t| mark.is_after(t)));
        self.statics = kept;
        let mut bytes = 0;
        for set in released {
            bytes += set.size;
            let backend = backend_at(&mut self.backends, set.backend)?;
            set.release(backend, ctx)?;
        }
        debug!(bytes, "released static tensors");
        Ok(bytes)
    }
}

fn backend_at(backends: &mut [Box<dyn Backend>], id: BackendId) -> Result<&mut dyn Backend> {
    match backends.get_mut(id.0) {
        Some(b) => Ok(b.as_mut()),
        None => Err(RuntimeError::Other(format!("unknown backend {}", id.0))),
    }
}

fn placement(ctx: &Context, tensor: TensorId) -> Result<BufferRef> {
    let t = ctx.tensor(tensor)?;
    match t.data() {
        Some(TensorData::Buffer(at)) => Ok(at),
        _ => Err(RuntimeError::NotResident(t.name().to_string())),
    }
}

fn view(ctx: &Context, tensor: TensorId, at: BufferRef) -> Result<TensorView> {
    let t = ctx.tensor(tensor)?;
    Ok(TensorView {
        buffer: at.buffer,
        offset: at.offset,
        shape: t.shape().clone(),
        dtype: t.dtype(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gr_tensor::dtype::{decode, encode};
    use gr_tensor::{CpuBackend, DType, OpKind, PooledBackend, Role};

    fn cpu_only() -> Scheduler {
        Scheduler::new(vec![Box::new(CpuBackend::new())]).unwrap()
    }

    /// `y = a @ x + b` with a [2,2], x [2,1], b [2,1].
    fn affine(ctx: &mut Context) -> (TensorId, TensorId, TensorId, TensorId) {
        let a = ctx.declare_tensor([2, 2], DType::F32, Role::Parameter).unwrap();
        let x = ctx.declare_tensor([2, 1], DType::F32, Role::Input).unwrap();
        let b = ctx.declare_tensor([2, 1], DType::F32, Role::Parameter).unwrap();
        let ax = ctx.connect(OpKind::MatMul, &[a, x]).unwrap();
        let y = ctx.connect(OpKind::Add, &[ax, b]).unwrap();
        ctx.set_role(y, Role::Output).unwrap();
        (a, x, b, y)
    }

    fn fill(sched: &mut Scheduler, ctx: &mut Context, a: TensorId, x: TensorId, b: TensorId) {
        sched.alloc_tensors(ctx, &[a, x, b]).unwrap();
        sched.set_tensor(ctx, a, 0, &encode(&[1.0f32, 2.0, 3.0, 4.0])).unwrap();
        sched.set_tensor(ctx, x, 0, &encode(&[5.0f32, 6.0])).unwrap();
        sched.set_tensor(ctx, b, 0, &encode(&[0.5f32, -0.5])).unwrap();
    }

    #[test]
    fn test_empty_backend_list() {
        assert!(matches!(
            Scheduler::new(Vec::new()),
            Err(RuntimeError::EmptyBackendList)
        ));
    }

    #[test]
    fn test_single_backend_compute() {
        let mut ctx = Context::deferred(1 << 20);
        let (a, x, b, y) = affine(&mut ctx);
        let mut sched = cpu_only();
        fill(&mut sched, &mut ctx, a, x, b);

        let graph = ComputeGraph::build(&ctx, &[y]).unwrap();
        sched.compute(&mut ctx, &graph).unwrap();
        assert_eq!(sched.splits().len(), 1);
        assert!(sched.splits()[0].copies.is_empty());
        let out = decode::<f32>(&sched.get_tensor(&ctx, y, 0, 8).unwrap());
        assert_eq!(out, vec![17.5, 38.5]);
    }

    #[test]
    fn test_capability_fallback_copies_across_backends() {
        let mut ctx = Context::deferred(1 << 20);
        let (a, x, b, y) = affine(&mut ctx);
        let pool = PooledBackend::new("pool", 4096).without_op(OpKind::MatMul);
        let mut sched = Scheduler::new(vec![Box::new(pool), Box::new(CpuBackend::new())]).unwrap();
        assert_eq!(sched.backend_names(), vec!["pool".to_string(), "cpu".to_string()]);
        fill(&mut sched, &mut ctx, a, x, b);

        let graph = ComputeGraph::build(&ctx, &[y]).unwrap();
        sched.compute(&mut ctx, &graph).unwrap();

        let ax = graph.nodes()[0];
        assert_eq!(sched.assignment(ax), Some(BackendId(1)));
        assert_eq!(sched.assignment(y), Some(BackendId(0)));
        let splits = sched.splits();
        assert_eq!(splits.len(), 2);
        // a and x mirrored to cpu, the matmul result mirrored back
        assert_eq!(splits[0].copies.len(), 2);
        assert_eq!(splits[1].copies.len(), 1);
        assert_eq!(splits[1].copies[0].tensor, ax);

        let out = decode::<f32>(&sched.get_tensor(&ctx, y, 0, 8).unwrap());
        assert_eq!(out, vec![17.5, 38.5]);
    }

    #[test]
    fn test_no_capable_backend() {
        let mut ctx = Context::deferred(1 << 20);
        let (a, x, b, y) = affine(&mut ctx);
        let pool = PooledBackend::new("pool", 4096).without_op(OpKind::MatMul);
        let mut sched = Scheduler::new(vec![Box::new(pool)]).unwrap();
        fill(&mut sched, &mut ctx, a, x, b);
        let graph = ComputeGraph::build(&ctx, &[y]).unwrap();
        match sched.compute(&mut ctx, &graph) {
            Err(RuntimeError::NoCapableBackend { op, .. }) => assert_eq!(op, OpKind::MatMul),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_leaf_without_data() {
        let mut ctx = Context::deferred(1 << 20);
        let (_, _, _, y) = affine(&mut ctx);
        let mut sched = cpu_only();
        let graph = ComputeGraph::build(&ctx, &[y]).unwrap();
        assert!(matches!(
            sched.compute(&mut ctx, &graph),
            Err(RuntimeError::NotResident(_))
        ));
    }

    #[test]
    fn test_repeated_compute_is_identical() {
        let mut ctx = Context::deferred(1 << 20);
        let (a, x, b, y) = affine(&mut ctx);
        let pool = PooledBackend::new("pool", 4096).without_op(OpKind::MatMul);
        let mut sched = Scheduler::new(vec![Box::new(pool), Box::new(CpuBackend::new())]).unwrap();
        fill(&mut sched, &mut ctx, a, x, b);
        let graph = ComputeGraph::build(&ctx, &[y]).unwrap();

        sched.compute(&mut ctx, &graph).unwrap();
        let first = sched.get_tensor(&ctx, y, 0, 8).unwrap();
        sched.compute(&mut ctx, &graph).unwrap();
        assert_eq!(sched.get_tensor(&ctx, y, 0, 8).unwrap(), first);
    }

    #[test]
    fn test_new_graph_replans() {
        let mut ctx = Context::deferred(1 << 20);
        let (a, x, b, y) = affine(&mut ctx);
        let sq = ctx.connect(OpKind::Sqr, &[y]).unwrap();
        let mut sched = cpu_only();
        fill(&mut sched, &mut ctx, a, x, b);

        let first = ComputeGraph::build(&ctx, &[y]).unwrap();
        sched.compute(&mut ctx, &first).unwrap();
        let second = ComputeGraph::build(&ctx, &[sq]).unwrap();
        sched.compute(&mut ctx, &second).unwrap();
        assert_eq!(sched.splits()[0].nodes.len(), 3);
        let out = decode::<f32>(&sched.get_tensor(&ctx, sq, 0, 8).unwrap());
        assert_eq!(out, vec![306.25, 1482.25]);
    }

    #[test]
    fn test_reset_keeps_static_tensors() {
        let mut ctx = Context::deferred(1 << 20);
        let (a, x, b, y) = affine(&mut ctx);
        let mut sched = cpu_only();
        fill(&mut sched, &mut ctx, a, x, b);
        let graph = ComputeGraph::build(&ctx, &[y]).unwrap();
        sched.compute(&mut ctx, &graph).unwrap();

        sched.reset(&mut ctx).unwrap();
        let cpu = sched.backend(BackendId(0)).unwrap();
        assert_eq!(cpu.allocated_bytes(), sched.static_bytes());
        assert!(sched.splits().is_empty());
        assert!(matches!(
            sched.get_tensor(&ctx, y, 0, 8),
            Err(RuntimeError::NotResident(_))
        ));
        assert_eq!(decode::<f32>(&sched.get_tensor(&ctx, x, 0, 8).unwrap()), vec![5.0, 6.0]);
    }

    #[test]
    fn test_release_after_mark() {
        let mut ctx = Context::deferred(1 << 20);
        let (a, x, b, y) = affine(&mut ctx);
        let mut sched = cpu_only();
        fill(&mut sched, &mut ctx, a, x, b);
        let kept = sched.static_bytes();

        let mark = ctx.mark();
        let k = ctx.declare_tensor([2, 1], DType::F32, Role::Constant).unwrap();
        let shifted = ctx.connect(OpKind::Add, &[y, k]).unwrap();
        sched.alloc_tensors(&mut ctx, &[k]).unwrap();
        sched.set_tensor(&ctx, k, 0, &encode(&[1.0f32, 1.0])).unwrap();
        let graph = ComputeGraph::build(&ctx, &[shifted]).unwrap();
        sched.compute(&mut ctx, &graph).unwrap();
        assert!(sched.static_bytes() > kept);

        assert!(sched.release_after(&mut ctx, mark).unwrap() > 0);
        assert_eq!(sched.static_bytes(), kept);
        assert!(sched.splits().is_empty());
        let cpu = sched.backend(BackendId(0)).unwrap();
        assert_eq!(cpu.allocated_bytes(), kept);
        ctx.rewind(mark).unwrap();

        let graph = ComputeGraph::build(&ctx, &[y]).unwrap();
        sched.compute(&mut ctx, &graph).unwrap();
        assert_eq!(decode::<f32>(&sched.get_tensor(&ctx, y, 0, 8).unwrap()), vec![17.5, 38.5]);
    }

    #[test]
    fn test_mirror_buffer_too_large() {
        let mut ctx = Context::deferred(1 << 20);
        let big = ctx.declare_tensor([64], DType::F32, Role::Input).unwrap();
        let s = ctx.connect(OpKind::Sum, &[big]).unwrap();
        let small = PooledBackend::new("small", 128).with_ops(&[OpKind::Sum]);
        let mut sched = Scheduler::new(vec![Box::new(small), Box::new(CpuBackend::new())]).unwrap();
        sched.alloc_tensors_on(BackendId(1), &mut ctx, &[big]).unwrap();
        let graph = ComputeGraph::build(&ctx, &[s]).unwrap();
        match sched.compute(&mut ctx, &graph) {
            Err(RuntimeError::AllocationFailed { backend, tensor, .. }) => {
                assert_eq!(backend, "small");
                assert_eq!(tensor, ctx.tensor(big).unwrap().name());
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(sched.backend(BackendId(0)).unwrap().allocated_bytes(), 0);
    }
}
