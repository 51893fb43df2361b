use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

use half::f16;

/// Supported element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 64-bit floating point.
    F64,
    /// 16-bit floating point (via the `half` crate). Host storage only;
    /// graph tensors and kernels use F32 or F64.
    F16,
}

impl DType {
    /// Returns the size in bytes of a single element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::F16 => 2,
        }
    }

    /// Returns true if tensors of this type can take part in a graph.
    pub fn is_graph_type(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
            DType::F16 => write!(f, "f16"),
        }
    }
}

/// A Rust scalar type that maps onto a [`DType`].
///
/// Tensor data always travels as little-endian bytes; this trait converts
/// between those bytes and typed values.
pub trait Element: Copy + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
    fn write_le(self, out: &mut Vec<u8>);
    /// Decodes one element. `bytes` must be exactly `DTYPE.size_in_bytes()` long.
    fn read_le(bytes: &[u8]) -> Self;
}

/// Element types the host kernels can compute with.
pub trait KernelFloat:
    Element
    + PartialEq
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
{
    fn zero() -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut b = [0u8; 4];
        b.copy_from_slice(bytes);
        f32::from_le_bytes(b)
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(v: f64) -> Self {
        v
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut b = [0u8; 8];
        b.copy_from_slice(bytes);
        f64::from_le_bytes(b)
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    fn from_f64(v: f64) -> Self {
        f16::from_f64(v)
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut b = [0u8; 2];
        b.copy_from_slice(bytes);
        f16::from_le_bytes(b)
    }
}

impl KernelFloat for f32 {
    fn zero() -> Self {
        0.0
    }
}

impl KernelFloat for f64 {
    fn zero() -> Self {
        0.0
    }
}

/// Encodes a slice of elements as little-endian bytes.
pub fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::DTYPE.size_in_bytes());
    for v in values {
        v.write_le(&mut out);
    }
    out
}

/// Decodes little-endian bytes into elements. Trailing partial elements are ignored.
pub fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::DTYPE.size_in_bytes())
        .map(T::read_le)
        .collect()
}

/// Re-encodes raw bytes of type `from` as bytes of type `to`.
pub fn convert(bytes: &[u8], from: DType, to: DType) -> Vec<u8> {
    if from == to {
        return bytes.to_vec();
    }
    let values: Vec<f64> = match from {
        DType::F32 => decode::<f32>(bytes).into_iter().map(Element::to_f64).collect(),
        DType::F64 => decode::<f64>(bytes),
        DType::F16 => decode::<f16>(bytes).into_iter().map(Element::to_f64).collect(),
    };
    match to {
        DType::F32 => encode(&values.iter().map(|&v| f32::from_f64(v)).collect::<Vec<_>>()),
        DType::F64 => encode(&values),
        DType::F16 => encode(&values.iter().map(|&v| f16::from_f64(v)).collect::<Vec<_>>()),
    }
}
