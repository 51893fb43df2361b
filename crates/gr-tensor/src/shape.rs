use crate::dtype::DType;
use crate::error::{Result, TensorError};
use std::fmt;

/// Dimension sizes of a tensor, outermost first. Graph tensors always have
/// rank >= 1 and no zero-sized dimension (see [`Shape::validate`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    pub fn from_slice(dims: &[usize]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }

    /// Shape of a single-element tensor.
    pub fn scalar() -> Self {
        Shape { dims: vec![1] }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Panics if `i >= ndim()`.
    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Size in bytes of a contiguous tensor of this shape.
    pub fn nbytes(&self, dtype: DType) -> usize {
        self.numel() * dtype.size_in_bytes()
    }

    /// Rejects rank-0 shapes and shapes with a zero-sized dimension.
    pub fn validate(&self) -> Result<()> {
        if self.dims.is_empty() || self.dims.contains(&0) {
            return Err(TensorError::InvalidShape {
                dims: self.dims.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::from_slice(&dims)
    }
}
