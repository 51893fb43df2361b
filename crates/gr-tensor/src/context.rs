use std::fmt;

use crate::backend::BufferRef;
use crate::dtype::{decode, encode, DType, Element};
use crate::error::{Result, TensorError};
use crate::graph::ComputeGraph;
use crate::kernels;
use crate::op::OpKind;
use crate::shape::Shape;

/// Bytes of context memory consumed by the metadata of one tensor.
pub const TENSOR_OVERHEAD: usize = 256;

/// Alignment of tensor data inside an allocating context's arena.
pub const ARENA_ALIGNMENT: usize = 16;

/// Index of a tensor inside the context that declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

impl TensorId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a tensor is used for. A tensor holds exactly one role at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Constant,
    Input,
    /// Trainable; the only role eligible for gradient updates.
    Parameter,
    Intermediate,
    Output,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Constant => "constant",
            Role::Input => "input",
            Role::Parameter => "parameter",
            Role::Intermediate => "intermediate",
            Role::Output => "output",
        };
        f.write_str(s)
    }
}

/// Where a tensor's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorData {
    /// Inside the owning context's own arena (allocating mode).
    Arena { offset: usize },
    /// Inside a buffer owned by a backend (deferred mode).
    Buffer(BufferRef),
}

/// A symbolic tensor. Leaves have no op; every other node records the
/// operation edge that produces it.
#[derive(Debug, Clone)]
pub struct TensorNode {
    name: String,
    shape: Shape,
    dtype: DType,
    role: Role,
    op: Option<OpKind>,
    param: f64,
    src: Vec<TensorId>,
    data: Option<TensorData>,
}

impl TensorNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The operator producing this tensor, or `None` for leaves.
    pub fn op(&self) -> Option<OpKind> {
        self.op
    }

    /// Scalar operator parameter (the factor of a `Scale` edge).
    pub fn param(&self) -> f64 {
        self.param
    }

    /// Inputs of the producing edge, in order.
    pub fn src(&self) -> &[TensorId] {
        &self.src
    }

    pub fn data(&self) -> Option<TensorData> {
        self.data
    }

    pub fn is_leaf(&self) -> bool {
        self.op.is_none()
    }

    pub fn nbytes(&self) -> usize {
        self.shape.nbytes(self.dtype)
    }

    /// Checks that `count` elements of `T` fit this tensor exactly.
    pub fn check_elements<T: Element>(&self, count: usize) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(TensorError::TypeMismatch {
                expected: self.dtype,
                got: T::DTYPE,
            });
        }
        if count != self.shape.numel() {
            return Err(TensorError::ShapeMismatch {
                op: format!("access '{}'", self.name),
                expected: vec![self.shape.numel()],
                got: vec![count],
            });
        }
        Ok(())
    }
}

/// Configuration of a [`Context`].
#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    /// Upper bound on context memory: tensor metadata, plus tensor data in
    /// allocating mode.
    pub mem_size: usize,
    /// Deferred mode: tensor data is placed later by backends.
    pub no_alloc: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            mem_size: 16 * 1024 * 1024,
            no_alloc: false,
        }
    }
}

/// Position in a [`Context`] that [`Context::rewind`] can return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextMark {
    tensors: usize,
    used: usize,
    arena: usize,
}

impl ContextMark {
    /// Id the next declared tensor receives.
    pub fn first_id(&self) -> TensorId {
        TensorId(self.tensors)
    }

    /// True if `id` was declared after this mark was taken.
    pub fn is_after(&self, id: TensorId) -> bool {
        id.0 >= self.tensors
    }
}

/// Arena owning tensors and the operation edges between them.
///
/// An edge can only reference tensors that already exist, so edges always
/// point at lower ids and the graph is acyclic by construction.
#[derive(Debug)]
pub struct Context {
    params: ContextParams,
    used: usize,
    tensors: Vec<TensorNode>,
    arena: Vec<u8>,
}

impl Context {
    pub fn new(params: ContextParams) -> Self {
        Context {
            params,
            used: 0,
            tensors: Vec::new(),
            arena: Vec::new(),
        }
    }

    /// Convenience constructor for a deferred context.
    pub fn deferred(mem_size: usize) -> Self {
        Self::new(ContextParams {
            mem_size,
            no_alloc: true,
        })
    }

    /// True if tensor data lives in this context's own arena.
    pub fn is_allocating(&self) -> bool {
        !self.params.no_alloc
    }

    pub fn mem_size(&self) -> usize {
        self.params.mem_size
    }

    pub fn used_mem(&self) -> usize {
        self.used
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TensorId> + '_ {
        (0..self.tensors.len()).map(TensorId)
    }

    pub fn mark(&self) -> ContextMark {
        ContextMark {
            tensors: self.tensors.len(),
            used: self.used,
            arena: self.arena.len(),
        }
    }

    /// Drops every tensor declared after `mark` and returns their memory.
    ///
    /// Callers must not hold ids of dropped tensors. Backend placements of
    /// dropped tensors are forgotten, not freed.
    pub fn rewind(&mut self, mark: ContextMark) -> Result<()> {
        if mark.tensors > self.tensors.len() || mark.used > self.used {
            return Err(TensorError::Other(format!(
                "cannot rewind to tensor {} of {}",
                mark.tensors,
                self.tensors.len()
            )));
        }
        self.tensors.truncate(mark.tensors);
        self.arena.truncate(mark.arena);
        self.used = mark.used;
        Ok(())
    }

    pub fn tensor(&self, id: TensorId) -> Result<&TensorNode> {
        self.tensors
            .get(id.0)
            .ok_or(TensorError::UnknownTensor(id.0))
    }

    fn tensor_mut(&mut self, id: TensorId) -> Result<&mut TensorNode> {
        self.tensors
            .get_mut(id.0)
            .ok_or(TensorError::UnknownTensor(id.0))
    }

    /// Looks a tensor up by name.
    pub fn find(&self, name: &str) -> Option<TensorId> {
        self.tensors.iter().position(|t| t.name == name).map(TensorId)
    }

    /// All tensors currently holding `role`, in declaration order.
    pub fn with_role(&self, role: Role) -> Vec<TensorId> {
        self.ids()
            .filter(|id| self.tensors[id.0].role == role)
            .collect()
    }

    /// Declares a leaf tensor.
    pub fn declare_tensor(
        &mut self,
        shape: impl Into<Shape>,
        dtype: DType,
        role: Role,
    ) -> Result<TensorId> {
        let shape = shape.into();
        shape.validate()?;
        if !dtype.is_graph_type() {
            return Err(TensorError::TypeMismatch {
                expected: DType::F32,
                got: dtype,
            });
        }
        let name = format!("t{}", self.tensors.len());
        if role == Role::Intermediate {
            return Err(TensorError::InvalidRole {
                tensor: name,
                role: role.to_string(),
            });
        }
        self.push(name, shape, dtype, role, None, 0.0, Vec::new())
    }

    /// Appends an operation edge and returns its output tensor.
    pub fn connect(&mut self, kind: OpKind, inputs: &[TensorId]) -> Result<TensorId> {
        let param = if kind == OpKind::Scale { 1.0 } else { 0.0 };
        self.connect_with_param(kind, inputs, param)
    }

    /// `input * factor`.
    pub fn scale(&mut self, input: TensorId, factor: f64) -> Result<TensorId> {
        self.connect_with_param(OpKind::Scale, &[input], factor)
    }

    fn connect_with_param(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        param: f64,
    ) -> Result<TensorId> {
        let mut shapes = Vec::with_capacity(inputs.len());
        let mut dtype = None;
        for &id in inputs {
            let t = self.tensor(id)?;
            match dtype {
                None => dtype = Some(t.dtype),
                Some(d) if d != t.dtype => {
                    return Err(TensorError::TypeMismatch {
                        expected: d,
                        got: t.dtype,
                    })
                }
                Some(_) => {}
            }
            shapes.push(&t.shape);
        }
        let shape = kind.infer_shape(&shapes)?;
        let dtype = dtype.unwrap_or(DType::F32);
        let name = format!("t{}", self.tensors.len());
        self.push(
            name,
            shape,
            dtype,
            Role::Intermediate,
            Some(kind),
            param,
            inputs.to_vec(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        name: String,
        shape: Shape,
        dtype: DType,
        role: Role,
        op: Option<OpKind>,
        param: f64,
        src: Vec<TensorId>,
    ) -> Result<TensorId> {
        let nbytes = shape.nbytes(dtype);
        let data_bytes = if self.is_allocating() {
            align_up(nbytes, ARENA_ALIGNMENT)
        } else {
            0
        };
        let needed = TENSOR_OVERHEAD + data_bytes;
        let available = self.params.mem_size.saturating_sub(self.used);
        if needed > available {
            return Err(TensorError::ContextExhausted { needed, available });
        }
        self.used += needed;

        let data = if self.is_allocating() {
            let offset = self.arena.len();
            self.arena.resize(offset + data_bytes, 0);
            Some(TensorData::Arena { offset })
        } else {
            None
        };

        let id = TensorId(self.tensors.len());
        self.tensors.push(TensorNode {
            name,
            shape,
            dtype,
            role,
            op,
            param,
            src,
            data,
        });
        Ok(id)
    }

    /// Changes a tensor's role. Idempotent.
    pub fn set_role(&mut self, id: TensorId, role: Role) -> Result<()> {
        let t = self.tensor_mut(id)?;
        let allowed = match role {
            Role::Output => true,
            Role::Intermediate => !t.is_leaf(),
            Role::Constant | Role::Input | Role::Parameter => t.is_leaf(),
        };
        if !allowed {
            return Err(TensorError::InvalidRole {
                tensor: t.name.clone(),
                role: role.to_string(),
            });
        }
        t.role = role;
        Ok(())
    }

    pub fn set_name(&mut self, id: TensorId, name: impl Into<String>) -> Result<()> {
        self.tensor_mut(id)?.name = name.into();
        Ok(())
    }

    /// Records that a tensor's bytes live in a backend buffer.
    pub fn bind(&mut self, id: TensorId, at: BufferRef) -> Result<()> {
        if self.is_allocating() {
            return Err(TensorError::ModeMismatch(
                "allocating contexts own their tensor data".to_string(),
            ));
        }
        self.tensor_mut(id)?.data = Some(TensorData::Buffer(at));
        Ok(())
    }

    /// Forgets a tensor's backend placement.
    pub fn unbind(&mut self, id: TensorId) -> Result<()> {
        if self.is_allocating() {
            return Err(TensorError::ModeMismatch(
                "allocating contexts own their tensor data".to_string(),
            ));
        }
        self.tensor_mut(id)?.data = None;
        Ok(())
    }

    fn arena_range(&self, id: TensorId, offset: usize, len: usize) -> Result<usize> {
        let t = self.tensor(id)?;
        let base = match t.data {
            Some(TensorData::Arena { offset }) => offset,
            _ => {
                return Err(TensorError::ModeMismatch(format!(
                    "tensor '{}' is not in the context arena",
                    t.name
                )))
            }
        };
        check_range(offset, len, t.nbytes())?;
        Ok(base + offset)
    }

    /// Writes raw bytes into an arena-resident tensor.
    pub fn write(&mut self, id: TensorId, offset: usize, bytes: &[u8]) -> Result<()> {
        let start = self.arena_range(id, offset, bytes.len())?;
        self.arena[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads raw bytes from an arena-resident tensor.
    pub fn read(&self, id: TensorId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let start = self.arena_range(id, offset, len)?;
        Ok(self.arena[start..start + len].to_vec())
    }

    pub fn set_values<T: Element>(&mut self, id: TensorId, values: &[T]) -> Result<()> {
        self.tensor(id)?.check_elements::<T>(values.len())?;
        self.write(id, 0, &encode(values))
    }

    pub fn values<T: Element>(&self, id: TensorId) -> Result<Vec<T>> {
        let t = self.tensor(id)?;
        t.check_elements::<T>(t.shape.numel())?;
        Ok(decode(&self.read(id, 0, t.nbytes())?))
    }

    /// Evaluates every node of `graph` on the host arena.
    pub fn compute(&mut self, graph: &ComputeGraph) -> Result<()> {
        if !self.is_allocating() {
            return Err(TensorError::ModeMismatch(
                "deferred contexts are computed through backends".to_string(),
            ));
        }
        for &id in graph.nodes() {
            let node = self.tensor(id)?;
            let op = node
                .op
                .ok_or_else(|| TensorError::Other(format!("'{}' is not an op node", node.name)))?;
            let out = {
                let mut inputs = Vec::with_capacity(node.src.len());
                for &s in &node.src {
                    let src = self.tensor(s)?;
                    let start = self.arena_range(s, 0, src.nbytes())?;
                    inputs.push((&self.arena[start..start + src.nbytes()], &src.shape));
                }
                kernels::compute(op, node.param, node.dtype, &inputs, &node.shape)?
            };
            self.write(id, 0, &out)?;
        }
        Ok(())
    }
}

/// Rounds `n` up to a multiple of `alignment`.
pub fn align_up(n: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return n;
    }
    n.div_ceil(alignment) * alignment
}

/// Fails with `OutOfBounds` unless `offset..offset + len` lies within `size` bytes.
pub fn check_range(offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(TensorError::OutOfBounds { offset, len, size }),
    }
}
