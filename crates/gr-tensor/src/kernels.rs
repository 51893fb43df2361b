//! Host numeric kernels.
//!
//! Every backend lowers an operation edge to a call into [`compute`], which
//! takes the raw little-endian bytes of the inputs and returns the bytes of
//! the output. These are straightforward loops written for correctness.

use crate::dtype::{decode, encode, DType, KernelFloat};
use crate::error::{Result, TensorError};
use crate::op::OpKind;
use crate::shape::Shape;

/// Runs one operator over raw input bytes.
pub fn compute(
    kind: OpKind,
    param: f64,
    dtype: DType,
    inputs: &[(&[u8], &Shape)],
    output: &Shape,
) -> Result<Vec<u8>> {
    match dtype {
        DType::F32 => compute_typed::<f32>(kind, param, inputs, output),
        DType::F64 => compute_typed::<f64>(kind, param, inputs, output),
        DType::F16 => Err(TensorError::Execution {
            op: kind,
            reason: "no kernels for f16".to_string(),
        }),
    }
}

fn compute_typed<T: KernelFloat>(
    kind: OpKind,
    param: f64,
    inputs: &[(&[u8], &Shape)],
    output: &Shape,
) -> Result<Vec<u8>> {
    if inputs.len() != kind.arity() {
        return Err(fault(kind, format!("got {} inputs", inputs.len())));
    }
    let mut values = Vec::with_capacity(inputs.len());
    for (bytes, shape) in inputs {
        let v = decode::<T>(bytes);
        if v.len() != shape.numel() {
            return Err(fault(
                kind,
                format!(
                    "input holds {} elements, shape {} needs {}",
                    v.len(),
                    shape,
                    shape.numel()
                ),
            ));
        }
        values.push(v);
    }

    let out: Vec<T> = match kind {
        OpKind::Add => zip(&values[0], &values[1], |x, y| x + y),
        OpKind::Sub => zip(&values[0], &values[1], |x, y| x - y),
        OpKind::Mul => zip(&values[0], &values[1], |x, y| x * y),
        OpKind::MatMul => {
            let (m, k) = (inputs[0].1.dim(0), inputs[0].1.dim(1));
            let n = inputs[1].1.dim(1);
            matmul(&values[0], &values[1], m, k, n)
        }
        OpKind::Transpose => {
            let (rows, cols) = (inputs[0].1.dim(0), inputs[0].1.dim(1));
            let a = &values[0];
            let mut t = vec![T::zero(); a.len()];
            for i in 0..rows {
                for j in 0..cols {
                    t[j * rows + i] = a[i * cols + j];
                }
            }
            t
        }
        OpKind::Sqr => values[0].iter().map(|&x| x * x).collect(),
        OpKind::Scale => {
            let s = T::from_f64(param);
            values[0].iter().map(|&x| x * s).collect()
        }
        OpKind::Sum => vec![sum(&values[0])],
        OpKind::Mean => {
            let n = T::from_f64(values[0].len() as f64);
            vec![sum(&values[0]) / n]
        }
        OpKind::Repeat => vec![values[0][0]; output.numel()],
    };

    if out.len() != output.numel() {
        return Err(fault(
            kind,
            format!("produced {} elements for output shape {}", out.len(), output),
        ));
    }
    Ok(encode(&out))
}

fn zip<T: KernelFloat>(a: &[T], b: &[T], f: impl Fn(T, T) -> T) -> Vec<T> {
    a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
}

fn sum<T: KernelFloat>(a: &[T]) -> T {
    a.iter().fold(T::zero(), |acc, &x| acc + x)
}

fn matmul<T: KernelFloat>(a: &[T], b: &[T], m: usize, k: usize, n: usize) -> Vec<T> {
    let mut c = vec![T::zero(); m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = T::zero();
            for p in 0..k {
                acc = acc + a[i * k + p] * b[p * n + j];
            }
            c[i * n + j] = acc;
        }
    }
    c
}

fn fault(op: OpKind, reason: String) -> TensorError {
    TensorError::Execution { op, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: OpKind, param: f64, inputs: &[(Vec<f32>, Shape)], out: Shape) -> Vec<f32> {
        let bytes: Vec<(Vec<u8>, &Shape)> = inputs.iter().map(|(v, s)| (encode(v), s)).collect();
        let refs: Vec<(&[u8], &Shape)> = bytes.iter().map(|(b, s)| (b.as_slice(), *s)).collect();
        decode(&compute(kind, param, DType::F32, &refs, &out).unwrap())
    }

    #[test]
    fn test_add_mul() {
        let s = Shape::from([2]);
        let operands =
            |a: [f32; 2], b: [f32; 2]| vec![(a.to_vec(), s.clone()), (b.to_vec(), s.clone())];
        let r = run(OpKind::Add, 0.0, &operands([1.0, 2.0], [3.0, 4.0]), s.clone());
        assert_eq!(r, vec![4.0, 6.0]);
        let r = run(OpKind::Mul, 0.0, &operands([2.0, 3.0], [4.0, 5.0]), s.clone());
        assert_eq!(r, vec![8.0, 15.0]);
    }

    #[test]
    fn test_matmul_basic() {
        let s = Shape::from([2, 2]);
        let r = run(
            OpKind::MatMul,
            0.0,
            &[(vec![1.0, 2.0, 3.0, 4.0], s.clone()), (vec![5.0, 6.0, 7.0, 8.0], s.clone())],
            s,
        );
        assert_eq!(r, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_transpose() {
        let r = run(
            OpKind::Transpose,
            0.0,
            &[(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::from([2, 3]))],
            Shape::from([3, 2]),
        );
        assert_eq!(r, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_reductions() {
        let s = Shape::from([4]);
        let x = vec![1.0, 2.0, 3.0, 6.0];
        assert_eq!(run(OpKind::Sum, 0.0, &[(x.clone(), s.clone())], Shape::scalar()), vec![12.0]);
        assert_eq!(run(OpKind::Mean, 0.0, &[(x, s)], Shape::scalar()), vec![3.0]);
    }

    #[test]
    fn test_scale_and_repeat() {
        let s = Shape::from([3]);
        let r = run(OpKind::Scale, -2.0, &[(vec![1.0, 0.5, 3.0], s.clone())], s.clone());
        assert_eq!(r, vec![-2.0, -1.0, -6.0]);
        let repeat = [(vec![7.0], Shape::scalar()), (vec![0.0; 3], s.clone())];
        let r = run(OpKind::Repeat, 0.0, &repeat, s);
        assert_eq!(r, vec![7.0; 3]);
    }

    #[test]
    fn test_short_input_is_execution_error() {
        let s = Shape::from([4]);
        let bytes = encode(&[1.0f32, 2.0]);
        let err = compute(OpKind::Sqr, 0.0, DType::F32, &[(&bytes, &s)], &s).unwrap_err();
        assert!(matches!(err, TensorError::Execution { op: OpKind::Sqr, .. }));
    }

    #[test]
    fn test_f16_has_no_kernels() {
        let s = Shape::from([1]);
        let bytes = [0u8; 2];
        assert!(compute(OpKind::Sqr, 0.0, DType::F16, &[(&bytes, &s)], &s).is_err());
    }
}
