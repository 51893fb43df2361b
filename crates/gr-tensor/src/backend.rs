use std::fmt::Debug;

use tracing::debug;

use crate::context::{align_up, check_range, Context, TensorData, TensorId};
use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::kernels;
use crate::op::OpKind;
use crate::shape::Shape;

/// Position of a backend in the runtime's priority list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub usize);

/// Handle of a buffer, unique within the backend that allocated it.
pub type BufferId = usize;

/// Location of tensor bytes inside a backend buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRef {
    pub backend: BackendId,
    pub buffer: BufferId,
    pub offset: usize,
}

/// Memory properties of a backend's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferType {
    /// Required alignment of tensor offsets within a buffer.
    pub alignment: usize,
    /// Largest single buffer the backend will hand out.
    pub max_size: usize,
}

impl Default for BufferType {
    fn default() -> Self {
        Self {
            alignment: 32,
            max_size: usize::MAX,
        }
    }
}

/// A tensor as seen by a kernel: a typed, shaped window into one buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorView {
    pub buffer: BufferId,
    pub offset: usize,
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorView {
    pub fn nbytes(&self) -> usize {
        self.shape.nbytes(self.dtype)
    }
}

/// One operation edge lowered for execution on a specific backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    pub tensor: TensorId,
    pub op: OpKind,
    pub param: f64,
    pub inputs: Vec<TensorView>,
    pub output: TensorView,
}

/// Buffers holding a group of statically allocated tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSet {
    pub backend: BackendId,
    pub buffers: Vec<BufferId>,
    pub tensors: Vec<TensorId>,
    pub size: usize,
}

impl BufferSet {
    /// Frees every buffer of the set and clears the tensors' placements.
    pub fn release(self, backend: &mut dyn Backend, ctx: &mut Context) -> Result<()> {
        for id in &self.tensors {
            ctx.unbind(*id)?;
        }
        for buffer in self.buffers {
            backend.free_buffer(buffer);
        }
        Ok(())
    }
}

/// Trait for pluggable compute backends.
///
/// Implementors provide raw buffer management and a capability query; the
/// tensor-level operations (`allocate`, `write`, `read`) and the default
/// `execute` are built on top of those and are shared by every backend.
pub trait Backend: Debug {
    /// Returns the name of this backend (e.g., "cpu").
    fn name(&self) -> &str;

    fn buffer_type(&self) -> BufferType;

    /// Whether this backend can execute `op` on tensors of `dtype`.
    fn supports(&self, op: OpKind, dtype: DType) -> bool;

    /// Allocates a zeroed buffer of `size` bytes.
    ///
    /// Fails with `AllocationFailed` when memory cannot grow.
    fn alloc_buffer(&mut self, size: usize) -> Result<BufferId>;

    /// Releases a buffer. Unknown ids are ignored.
    fn free_buffer(&mut self, buffer: BufferId);

    fn buffer_size(&self, buffer: BufferId) -> Option<usize>;

    fn write_buffer(&mut self, buffer: BufferId, offset: usize, bytes: &[u8]) -> Result<()>;

    fn read_buffer(&self, buffer: BufferId, offset: usize, len: usize) -> Result<Vec<u8>>;

    /// Total bytes currently held in live buffers.
    fn allocated_bytes(&self) -> usize;

    /// Runs every launch in order, synchronously.
    fn execute(&mut self, launches: &[Launch]) -> Result<()> {
        for launch in launches {
            run_launch(self, launch)?;
        }
        Ok(())
    }

    /// Packs `tensors` into as few aligned buffers as `max_size` allows and
    /// binds them in `ctx`.
    fn allocate(
        &mut self,
        id: BackendId,
        ctx: &mut Context,
        tensors: &[TensorId],
    ) -> Result<BufferSet> {
        if ctx.is_allocating() {
            return Err(TensorError::ModeMismatch(
                "allocating contexts own their tensor data".to_string(),
            ));
        }
        let bt = self.buffer_type();

        // Group tensors into chunks that each fit in one buffer.
        let mut chunks: Vec<(usize, Vec<(TensorId, usize)>)> = Vec::new();
        let mut current: Vec<(TensorId, usize)> = Vec::new();
        let mut size = 0usize;
        for &t in tensors {
            let nbytes = align_up(ctx.tensor(t)?.nbytes(), bt.alignment);
            if nbytes > bt.max_size {
                return Err(TensorError::AllocationFailed {
                    backend: self.name().to_string(),
                    size: nbytes,
                });
            }
            if size + nbytes > bt.max_size {
                chunks.push((size, std::mem::take(&mut current)));
                size = 0;
            }
            current.push((t, size));
            size += nbytes;
        }
        if !current.is_empty() {
            chunks.push((size, current));
        }

        let mut set = BufferSet {
            backend: id,
            buffers: Vec::new(),
            tensors: tensors.to_vec(),
            size: 0,
        };
        for (chunk_size, members) in chunks {
            let buffer = match self.alloc_buffer(chunk_size.max(1)) {
                Ok(b) => b,
                Err(e) => {
                    for b in set.buffers.drain(..) {
                        self.free_buffer(b);
                    }
                    return Err(e);
                }
            };
            set.buffers.push(buffer);
            set.size += chunk_size;
            for (t, offset) in members {
                ctx.bind(
                    t,
                    BufferRef {
                        backend: id,
                        buffer,
                        offset,
                    },
                )?;
            }
        }
        debug!(
            backend = self.name(),
            tensors = tensors.len(),
            buffers = set.buffers.len(),
            bytes = set.size,
            "allocated tensors"
        );
        Ok(set)
    }

    /// Writes `bytes` at `offset` within a tensor resident on this backend.
    fn write(
        &mut self,
        id: BackendId,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let at = resident(id, ctx, tensor, offset, bytes.len())?;
        self.write_buffer(at.buffer, at.offset + offset, bytes)
    }

    /// Reads `len` bytes at `offset` from a tensor resident on this backend.
    fn read(
        &self,
        id: BackendId,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>> {
        let at = resident(id, ctx, tensor, offset, len)?;
        self.read_buffer(at.buffer, at.offset + offset, len)
    }
}

fn resident(
    id: BackendId,
    ctx: &Context,
    tensor: TensorId,
    offset: usize,
    len: usize,
) -> Result<BufferRef> {
    let t = ctx.tensor(tensor)?;
    check_range(offset, len, t.nbytes())?;
    match t.data() {
        Some(TensorData::Buffer(at)) if at.backend == id => Ok(at),
        _ => Err(TensorError::NoData(t.name().to_string())),
    }
}

/// Executes a single launch against a backend's own buffers.
pub fn run_launch<B: Backend + ?Sized>(backend: &mut B, launch: &Launch) -> Result<()> {
    let mut raw = Vec::with_capacity(launch.inputs.len());
    for view in &launch.inputs {
        let bytes = backend
            .read_buffer(view.buffer, view.offset, view.nbytes())
            .map_err(|e| TensorError::Execution {
                op: launch.op,
                reason: e.to_string(),
            })?;
        raw.push(bytes);
    }
    let inputs: Vec<(&[u8], &Shape)> = raw
        .iter()
        .zip(launch.inputs.iter())
        .map(|(bytes, view)| (bytes.as_slice(), &view.shape))
        .collect();
    let out = kernels::compute(
        launch.op,
        launch.param,
        launch.output.dtype,
        &inputs,
        &launch.output.shape,
    )?;
    backend
        .write_buffer(launch.output.buffer, launch.output.offset, &out)
        .map_err(|e| TensorError::Execution {
            op: launch.op,
            reason: e.to_string(),
        })
}
