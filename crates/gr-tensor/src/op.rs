use std::fmt;

use crate::error::{Result, TensorError};
use crate::shape::Shape;

/// Operator kinds an operation edge can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    /// Elementwise `a + b`.
    Add,
    /// Elementwise `a - b`.
    Sub,
    /// Elementwise `a * b`.
    Mul,
    /// `[m, k] x [k, n] -> [m, n]`, row-major.
    MatMul,
    /// Swaps the two axes of a rank-2 tensor.
    Transpose,
    /// Elementwise `a * a`.
    Sqr,
    /// Multiplies every element by the edge's scalar parameter.
    Scale,
    /// Sum of all elements, shape `[1]`.
    Sum,
    /// Mean of all elements, shape `[1]`.
    Mean,
    /// Broadcasts a one-element tensor to the shape of the second operand.
    Repeat,
}

impl OpKind {
    pub const ALL: [OpKind; 10] = [
        OpKind::Add,
        OpKind::Sub,
        OpKind::Mul,
        OpKind::MatMul,
        OpKind::Transpose,
        OpKind::Sqr,
        OpKind::Scale,
        OpKind::Sum,
        OpKind::Mean,
        OpKind::Repeat,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::MatMul => "matmul",
            OpKind::Transpose => "transpose",
            OpKind::Sqr => "sqr",
            OpKind::Scale => "scale",
            OpKind::Sum => "sum",
            OpKind::Mean => "mean",
            OpKind::Repeat => "repeat",
        }
    }

    /// Number of input tensors the operator takes.
    pub fn arity(&self) -> usize {
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::MatMul | OpKind::Repeat => 2,
            OpKind::Transpose | OpKind::Sqr | OpKind::Scale | OpKind::Sum | OpKind::Mean => 1,
        }
    }

    /// Computes the output shape for the given input shapes.
    ///
    /// Elementwise operators require identical shapes; nothing is broadcast
    /// implicitly.
    pub fn infer_shape(&self, inputs: &[&Shape]) -> Result<Shape> {
        if inputs.len() != self.arity() {
            return Err(TensorError::Arity {
                op: *self,
                expected: self.arity(),
                got: inputs.len(),
            });
        }
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul => {
                if inputs[0] != inputs[1] {
                    return Err(self.mismatch(inputs[0], inputs[1]));
                }
                Ok(inputs[0].clone())
            }
            OpKind::MatMul => {
                let (a, b) = (inputs[0], inputs[1]);
                if a.ndim() != 2 || b.ndim() != 2 || a.dim(1) != b.dim(0) {
                    return Err(self.mismatch(a, b));
                }
                Ok(Shape::new(vec![a.dim(0), b.dim(1)]))
            }
            OpKind::Transpose => {
                let a = inputs[0];
                if a.ndim() != 2 {
                    return Err(TensorError::ShapeMismatch {
                        op: self.to_string(),
                        expected: vec![0, 0],
                        got: a.dims().to_vec(),
                    });
                }
                Ok(Shape::new(vec![a.dim(1), a.dim(0)]))
            }
            OpKind::Sqr | OpKind::Scale => Ok(inputs[0].clone()),
            OpKind::Sum | OpKind::Mean => Ok(Shape::scalar()),
            OpKind::Repeat => {
                if inputs[0].numel() != 1 {
                    return Err(TensorError::ShapeMismatch {
                        op: self.to_string(),
                        expected: vec![1],
                        got: inputs[0].dims().to_vec(),
                    });
                }
                Ok(inputs[1].clone())
            }
        }
    }

    fn mismatch(&self, expected: &Shape, got: &Shape) -> TensorError {
        TensorError::ShapeMismatch {
            op: self.to_string(),
            expected: expected.dims().to_vec(),
            got: got.dims().to_vec(),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
