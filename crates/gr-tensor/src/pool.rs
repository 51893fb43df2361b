use std::collections::{BTreeSet, HashMap};

use crate::backend::{run_launch, Backend, BufferId, BufferType, Launch};
use crate::context::{align_up, check_range};
use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::op::OpKind;

/// Alignment of buffers carved out of the pool.
pub const POOL_ALIGNMENT: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Region {
    offset: usize,
    size: usize,
    reserved: usize,
}

/// Backend whose buffers are carved out of one fixed-capacity memory pool.
///
/// Models a discrete device: memory is bounded (allocation fails once the
/// pool is exhausted or too fragmented) and the set of operators and dtypes
/// it can run is configurable. Launch lists are validated as a whole before
/// any of them runs.
#[derive(Debug, Clone)]
pub struct PooledBackend {
    name: String,
    memory: Vec<u8>,
    // (offset, size), sorted by offset, adjacent blocks merged
    free: Vec<(usize, usize)>,
    buffers: HashMap<BufferId, Region>,
    next_id: BufferId,
    ops: BTreeSet<OpKind>,
    dtypes: Vec<DType>,
}

impl PooledBackend {
    /// A pool of `capacity` bytes supporting every operator on F32.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        PooledBackend {
            name: name.into(),
            memory: vec![0; capacity],
            free: if capacity > 0 { vec![(0, capacity)] } else { Vec::new() },
            buffers: HashMap::new(),
            next_id: 0,
            ops: OpKind::ALL.iter().copied().collect(),
            dtypes: vec![DType::F32],
        }
    }

    /// Restricts the backend to exactly `ops`.
    pub fn with_ops(mut self, ops: &[OpKind]) -> Self {
        self.ops = ops.iter().copied().collect();
        self
    }

    pub fn without_op(mut self, op: OpKind) -> Self {
        self.ops.remove(&op);
        self
    }

    pub fn with_dtypes(mut self, dtypes: &[DType]) -> Self {
        self.dtypes = dtypes.iter().copied().filter(DType::is_graph_type).collect();
        self
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Bytes not reserved by any live buffer.
    pub fn free_bytes(&self) -> usize {
        self.free.iter().map(|&(_, size)| size).sum()
    }

    fn region(&self, id: BufferId) -> Result<Region> {
        self.buffers
            .get(&id)
            .copied()
            .ok_or(TensorError::UnknownBuffer(id))
    }

    fn check_launch(&self, launch: &Launch) -> Result<()> {
        if !self.supports(launch.op, launch.output.dtype) {
            return Err(TensorError::Execution {
                op: launch.op,
                reason: format!("not supported by '{}'", self.name),
            });
        }
        for view in launch.inputs.iter().chain(std::iter::once(&launch.output)) {
            let region = self.region(view.buffer).map_err(|e| TensorError::Execution {
                op: launch.op,
                reason: e.to_string(),
            })?;
            check_range(view.offset, view.nbytes(), region.size).map_err(|e| {
                TensorError::Execution {
                    op: launch.op,
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(())
    }
}

impl Backend for PooledBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffer_type(&self) -> BufferType {
        BufferType {
            alignment: POOL_ALIGNMENT,
            max_size: self.memory.len(),
        }
    }

    fn supports(&self, op: OpKind, dtype: DType) -> bool {
        self.ops.contains(&op) && self.dtypes.contains(&dtype)
    }

    fn alloc_buffer(&mut self, size: usize) -> Result<BufferId> {
        let reserved = align_up(size.max(1), POOL_ALIGNMENT);
        let slot = self
            .free
            .iter()
            .position(|&(_, block)| block >= reserved)
            .ok_or_else(|| TensorError::AllocationFailed {
                backend: self.name.clone(),
                size,
            })?;
        let (offset, block) = self.free[slot];
        if block == reserved {
            self.free.remove(slot);
        } else {
            self.free[slot] = (offset + reserved, block - reserved);
        }
        self.memory[offset..offset + reserved].fill(0);

        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(
            id,
            Region {
                offset,
                size,
                reserved,
            },
        );
        Ok(id)
    }

    fn free_buffer(&mut self, buffer: BufferId) {
        let Some(region) = self.buffers.remove(&buffer) else {
            return;
        };
        let at = self
            .free
            .partition_point(|&(offset, _)| offset < region.offset);
        self.free.insert(at, (region.offset, region.reserved));

        // merge with the following block, then with the preceding one
        if at + 1 < self.free.len() {
            let (offset, size) = self.free[at];
            let (next_offset, next_size) = self.free[at + 1];
            if offset + size == next_offset {
                self.free[at] = (offset, size + next_size);
                self.free.remove(at + 1);
            }
        }
        if at > 0 {
            let (prev_offset, prev_size) = self.free[at - 1];
            let (offset, size) = self.free[at];
            if prev_offset + prev_size == offset {
                self.free[at - 1] = (prev_offset, prev_size + size);
                self.free.remove(at);
            }
        }
    }

    fn buffer_size(&self, buffer: BufferId) -> Option<usize> {
        self.buffers.get(&buffer).map(|r| r.size)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: usize, bytes: &[u8]) -> Result<()> {
        let region = self.region(buffer)?;
        check_range(offset, bytes.len(), region.size)?;
        let start = region.offset + offset;
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let region = self.region(buffer)?;
        check_range(offset, len, region.size)?;
        let start = region.offset + offset;
        Ok(self.memory[start..start + len].to_vec())
    }

    fn allocated_bytes(&self) -> usize {
        self.buffers.values().map(|r| r.reserved).sum()
    }

    fn execute(&mut self, launches: &[Launch]) -> Result<()> {
        for launch in launches {
            self.check_launch(launch)?;
        }
        for launch in launches {
            run_launch(self, launch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendId, TensorView};
    use crate::context::{Context, Role, TensorId};
    use crate::dtype::{decode, encode};
    use crate::shape::Shape;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut pool = PooledBackend::new("dev", 256);
        let a = pool.alloc_buffer(100).unwrap();
        let _b = pool.alloc_buffer(100).unwrap();
        assert_eq!(pool.allocated_bytes(), 256);
        assert!(matches!(
            pool.alloc_buffer(1),
            Err(TensorError::AllocationFailed { .. })
        ));
        pool.free_buffer(a);
        assert!(pool.alloc_buffer(64).is_ok());
    }

    #[test]
    fn test_free_merges_blocks() {
        let mut pool = PooledBackend::new("dev", 192);
        let a = pool.alloc_buffer(64).unwrap();
        let b = pool.alloc_buffer(64).unwrap();
        let c = pool.alloc_buffer(64).unwrap();
        pool.free_buffer(a);
        pool.free_buffer(c);
        pool.free_buffer(b);
        assert_eq!(pool.free_bytes(), 192);
        assert!(pool.alloc_buffer(192).is_ok());
    }

    #[test]
    fn test_buffers_are_zeroed() {
        let mut pool = PooledBackend::new("dev", 64);
        let a = pool.alloc_buffer(4).unwrap();
        pool.write_buffer(a, 0, &[7; 4]).unwrap();
        pool.free_buffer(a);
        let b = pool.alloc_buffer(4).unwrap();
        assert_eq!(pool.read_buffer(b, 0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_capabilities() {
        let pool = PooledBackend::new("dev", 64).without_op(OpKind::MatMul);
        assert!(!pool.supports(OpKind::MatMul, DType::F32));
        assert!(pool.supports(OpKind::Add, DType::F32));
        assert!(!pool.supports(OpKind::Add, DType::F64));
        let pool = pool.with_dtypes(&[DType::F32, DType::F64, DType::F16]);
        assert!(pool.supports(OpKind::Add, DType::F64));
        assert!(!pool.supports(OpKind::Add, DType::F16));
    }

    #[test]
    fn test_tensor_access_through_pool() {
        let mut pool = PooledBackend::new("dev", 1024);
        let mut ctx = Context::deferred(1 << 20);
        let a = ctx.declare_tensor([2], DType::F32, Role::Parameter).unwrap();
        pool.allocate(BackendId(1), &mut ctx, &[a]).unwrap();
        pool.write(BackendId(1), &ctx, a, 0, &encode(&[3.0f32, 4.0])).unwrap();
        assert_eq!(decode::<f32>(&pool.read(BackendId(1), &ctx, a, 0, 8).unwrap()), vec![3.0, 4.0]);
        assert!(matches!(
            pool.write(BackendId(1), &ctx, a, 4, &[0; 8]),
            Err(TensorError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_allocate_too_large() {
        let mut pool = PooledBackend::new("dev", 64);
        let mut ctx = Context::deferred(1 << 20);
        let a = ctx.declare_tensor([32], DType::F32, Role::Parameter).unwrap();
        assert!(matches!(
            pool.allocate(BackendId(0), &mut ctx, &[a]),
            Err(TensorError::AllocationFailed { .. })
        ));
        assert_eq!(pool.allocated_bytes(), 0);
    }

    #[test]
    fn test_execute_validates_before_running() {
        let mut pool = PooledBackend::new("dev", 256).without_op(OpKind::Sub);
        let buf = pool.alloc_buffer(16).unwrap();
        pool.write_buffer(buf, 0, &encode(&[2.0f32, 3.0])).unwrap();
        let view = |offset| TensorView {
            buffer: buf,
            offset,
            shape: Shape::from([2]),
            dtype: DType::F32,
        };
        let mut ctx = Context::deferred(1 << 20);
        let t: TensorId = ctx.declare_tensor([1], DType::F32, Role::Output).unwrap();
        let sqr = Launch {
            tensor: t,
            op: OpKind::Sqr,
            param: 0.0,
            inputs: vec![view(0)],
            output: view(8),
        };
        let sub = Launch {
            op: OpKind::Sub,
            inputs: vec![view(0), view(0)],
            ..sqr.clone()
        };
        let err = pool.execute(&[sqr.clone(), sub]).unwrap_err();
        assert!(matches!(err, TensorError::Execution { op: OpKind::Sub, .. }));
        // nothing ran
        assert_eq!(decode::<f32>(&pool.read_buffer(buf, 8, 8).unwrap()), vec![0.0, 0.0]);

        pool.execute(&[sqr]).unwrap();
        assert_eq!(decode::<f32>(&pool.read_buffer(buf, 8, 8).unwrap()), vec![4.0, 9.0]);
    }
}
