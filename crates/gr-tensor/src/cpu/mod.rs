use crate::backend::{Backend, BufferId, BufferType};
use crate::context::check_range;
use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::op::OpKind;

/// Host alignment of tensor data inside CPU buffers.
pub const CPU_ALIGNMENT: usize = 32;

/// Pure-Rust CPU compute backend.
///
/// Every buffer is its own heap allocation. Supports every operator for
/// F32 and F64, so it is always usable as the fallback of last resort.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    // Freed slots stay `None` so ids are never handed out twice.
    buffers: Vec<Option<Vec<u8>>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend {
            buffers: Vec::new(),
        }
    }

    fn buffer(&self, id: BufferId) -> Result<&Vec<u8>> {
        self.buffers
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(TensorError::UnknownBuffer(id))
    }

    fn buffer_mut(&mut self, id: BufferId) -> Result<&mut Vec<u8>> {
        self.buffers
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(TensorError::UnknownBuffer(id))
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn buffer_type(&self) -> BufferType {
        BufferType {
            alignment: CPU_ALIGNMENT,
            max_size: usize::MAX,
        }
    }

    fn supports(&self, _op: OpKind, dtype: DType) -> bool {
        dtype.is_graph_type()
    }

    fn alloc_buffer(&mut self, size: usize) -> Result<BufferId> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| TensorError::AllocationFailed {
                backend: self.name().to_string(),
                size,
            })?;
        data.resize(size, 0);
        self.buffers.push(Some(data));
        Ok(self.buffers.len() - 1)
    }

    fn free_buffer(&mut self, buffer: BufferId) {
        if let Some(slot) = self.buffers.get_mut(buffer) {
            *slot = None;
        }
    }

    fn buffer_size(&self, buffer: BufferId) -> Option<usize> {
        self.buffer(buffer).ok().map(Vec::len)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: usize, bytes: &[u8]) -> Result<()> {
        let data = self.buffer_mut(buffer)?;
        check_range(offset, bytes.len(), data.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let data = self.buffer(buffer)?;
        check_range(offset, len, data.len())?;
        Ok(data[offset..offset + len].to_vec())
    }

    fn allocated_bytes(&self) -> usize {
        self.buffers.iter().flatten().map(Vec::len).sum()
    }
}
