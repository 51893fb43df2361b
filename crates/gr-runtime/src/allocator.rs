//! Liveness-based memory planning for compute graphs.
//!
//! Every op-produced tensor of a graph gets an offset inside one compute
//! buffer. Regions are recycled as soon as the last node reading them has
//! been scheduled, so the buffer only has to hold the peak working set
//! instead of every intermediate at once.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use gr_tensor::context::align_up;
use gr_tensor::{
    Backend, BackendId, BufferId, BufferRef, BufferType, ComputeGraph, Context, Role, TensorError,
    TensorId,
};

use crate::error::{Result, RuntimeError};

/// Region of the compute buffer assigned to one tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub tensor: TensorId,
    pub offset: usize,
    pub size: usize,
}

/// Result of planning one backend's share of a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub backend: BackendId,
    /// `None` when there was nothing to place.
    pub buffer: Option<BufferId>,
    /// Size of the compute buffer, i.e. the high-water mark of the plan.
    pub peak_bytes: usize,
    /// Allocations satisfied from a previously freed region.
    pub n_reused: usize,
    pub placements: Vec<Placement>,
}

impl AllocationPlan {
    pub fn placement(&self, tensor: TensorId) -> Option<&Placement> {
        self.placements.iter().find(|p| p.tensor == tensor)
    }
}

/// Offsets inside a growable region, with freed blocks kept sorted by offset.
#[derive(Debug, Default)]
struct FreeList {
    blocks: Vec<(usize, usize)>,
    end: usize,
    peak: usize,
}

impl FreeList {
    /// Best fit among free blocks, else grows at the end. Returns the offset
    /// and whether a freed block was reused.
    fn alloc(&mut self, size: usize) -> (usize, bool) {
        let mut best: Option<usize> = None;
        for (i, &(_, block)) in self.blocks.iter().enumerate() {
            if block >= size && best.map_or(true, |b| block < self.blocks[b].1) {
                best = Some(i);
            }
        }
        if let Some(i) = best {
            let (offset, block) = self.blocks[i];
            if block == size {
                self.blocks.remove(i);
            } else {
                self.blocks[i] = (offset + size, block - size);
            }
            return (offset, true);
        }

        let offset = self.end;
        self.end += size;
        self.peak = self.peak.max(self.end);
        (offset, false)
    }

    fn free(&mut self, offset: usize, size: usize) {
        let at = self.blocks.partition_point(|&(o, _)| o < offset);
        self.blocks.insert(at, (offset, size));

        if at + 1 < self.blocks.len() {
            let (o, s) = self.blocks[at];
            let (next_o, next_s) = self.blocks[at + 1];
            if o + s == next_o {
                self.blocks[at] = (o, s + next_s);
                self.blocks.remove(at + 1);
            }
        }
        if at > 0 {
            let (prev_o, prev_s) = self.blocks[at - 1];
            let (o, s) = self.blocks[at];
            if prev_o + prev_s == o {
                self.blocks[at - 1] = (prev_o, prev_s + s);
                self.blocks.remove(at);
            }
        }

        // a free block at the tail lowers the high-water mark
        if let Some(&(o, s)) = self.blocks.last() {
            if o + s == self.end {
                self.blocks.pop();
                self.end = o;
            }
        }
    }
}

/// Plans and owns the compute buffer of one backend.
#[derive(Debug)]
pub struct GraphAllocator {
    buffer_type: BufferType,
    buffer: Option<BufferId>,
    bound: Vec<TensorId>,
}

impl GraphAllocator {
    pub fn new(buffer_type: BufferType) -> Self {
        GraphAllocator {
            buffer_type,
            buffer: None,
            bound: Vec::new(),
        }
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    /// Places the outputs of `nodes` (a topologically ordered subset of
    /// `graph.nodes()`) in a freshly allocated buffer of `backend`.
    ///
    /// Tensors in `pinned`, graph outputs and tensors with role `Output`
    /// keep their region for the lifetime of the plan. Any buffer from a
    /// previous call is released first.
    pub fn alloc_graph(
        &mut self,
        ctx: &mut Context,
        graph: &ComputeGraph,
        nodes: &[TensorId],
        pinned: &HashSet<TensorId>,
        backend_id: BackendId,
        backend: &mut dyn Backend,
    ) -> Result<AllocationPlan> {
        if ctx.is_allocating() {
            return Err(TensorError::ModeMismatch(
                "allocating contexts own their tensor data".to_string(),
            )
            .into());
        }
        self.release(ctx, backend)?;

        // Readers on other backends are never decremented here, so their
        // producers stay live without extra bookkeeping.
        let mut remaining = graph.consumers(ctx)?;
        let mut keep: HashSet<TensorId> = pinned.clone();
        keep.extend(graph.outputs().iter().copied());

        let mut free = FreeList::default();
        let mut live: HashMap<TensorId, (usize, usize)> = HashMap::new();
        let mut placements = Vec::with_capacity(nodes.len());
        let mut n_reused = 0;
        let mut peak_tensor: Option<TensorId> = None;

        for &id in nodes {
            let t = ctx.tensor(id)?;
            if t.is_leaf() {
                return Err(RuntimeError::Other(format!(
                    "'{}' is a leaf, not a graph node",
                    t.name()
                )));
            }
            if t.role() == Role::Output {
                keep.insert(id);
            }

            let size = align_up(t.nbytes(), self.buffer_type.alignment);
            let before = free.peak;
            let (offset, reused) = free.alloc(size);
            if reused {
                n_reused += 1;
            }
            if free.peak > before {
                peak_tensor = Some(id);
            }
            live.insert(id, (offset, size));
            placements.push(Placement {
                tensor: id,
                offset,
                size,
            });

            for src in t.src() {
                if let Some(count) = remaining.get_mut(src) {
                    *count = count.saturating_sub(1);
                    if *count == 0 && !keep.contains(src) {
                        if let Some((o, s)) = live.remove(src) {
                            free.free(o, s);
                        }
                    }
                }
            }
            let unread = remaining.get(&id).copied().unwrap_or(0) == 0;
            if unread && !keep.contains(&id) {
                if let Some((o, s)) = live.remove(&id) {
                    free.free(o, s);
                }
            }
        }

        let mut plan = AllocationPlan {
            backend: backend_id,
            buffer: None,
            peak_bytes: free.peak,
            n_reused,
            placements,
        };
        if plan.placements.is_empty() {
            return Ok(plan);
        }

        let failed = |ctx: &Context, backend: &dyn Backend| {
            let tensor = peak_tensor
                .and_then(|t| ctx.tensor(t).ok())
                .map(|t| t.name().to_string())
                .unwrap_or_default();
            RuntimeError::AllocationFailed {
                backend: backend.name().to_string(),
                size: plan.peak_bytes,
                tensor,
            }
        };
        if plan.peak_bytes > self.buffer_type.max_size {
            return Err(failed(ctx, backend));
        }
        let buffer = match backend.alloc_buffer(plan.peak_bytes.max(1)) {
            Ok(b) => b,
            Err(TensorError::AllocationFailed { .. }) => return Err(failed(ctx, backend)),
            Err(e) => return Err(e.into()),
        };
        self.buffer = Some(buffer);
        plan.buffer = Some(buffer);

        for p in &plan.placements {
            ctx.bind(
                p.tensor,
                BufferRef {
                    backend: backend_id,
                    buffer,
                    offset: p.offset,
                },
            )?;
            self.bound.push(p.tensor);
        }

        debug!(
            backend = backend.name(),
            nodes = nodes.len(),
            peak_bytes = plan.peak_bytes,
            reused = plan.n_reused,
            "planned graph memory"
        );
        Ok(plan)
    }

    /// Frees the compute buffer and forgets the placements it backed.
    pub fn release(&mut self, ctx: &mut Context, backend: &mut dyn Backend) -> Result<()> {
        for t in self.bound.drain(..) {
            ctx.unbind(t)?;
        }
        if let Some(buffer) = self.buffer.take() {
            backend.free_buffer(buffer);
        }
        Ok(())
    }
}
