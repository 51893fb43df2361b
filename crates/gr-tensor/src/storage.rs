use half::f16;

use crate::dtype::{encode, DType, Element};
use crate::error::{Result, TensorError};

/// Host-resident typed storage, independent of any backend.
#[derive(Debug, Clone, PartialEq)]
pub enum HostStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    F16(Vec<f16>),
}

impl HostStorage {
    /// Number of elements in this storage.
    pub fn len(&self) -> usize {
        match self {
            HostStorage::F32(v) => v.len(),
            HostStorage::F64(v) => v.len(),
            HostStorage::F16(v) => v.len(),
        }
    }

    /// Returns true if the storage contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            HostStorage::F32(_) => DType::F32,
            HostStorage::F64(_) => DType::F64,
            HostStorage::F16(_) => DType::F16,
        }
    }

    /// Create zero-filled storage for the given dtype and element count.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::F32 => HostStorage::F32(vec![0.0; n]),
            DType::F64 => HostStorage::F64(vec![0.0; n]),
            DType::F16 => HostStorage::F16(vec![f16::ZERO; n]),
        }
    }

    /// Copies `values` into storage of the matching dtype.
    pub fn from_elements<T: Element>(values: &[T]) -> Self {
        match T::DTYPE {
            DType::F32 => HostStorage::F32(values.iter().map(|v| v.to_f64() as f32).collect()),
            DType::F64 => HostStorage::F64(values.iter().map(|v| v.to_f64()).collect()),
            DType::F16 => {
                HostStorage::F16(values.iter().map(|v| f16::from_f64(v.to_f64())).collect())
            }
        }
    }

    /// Encodes elements `start..start + len` as little-endian bytes of
    /// type `dtype`, converting if the storage type differs.
    pub fn encode_range(&self, start: usize, len: usize, dtype: DType) -> Result<Vec<u8>> {
        let end = start + len;
        if end > self.len() {
            return Err(TensorError::OutOfBounds {
                offset: start,
                len,
                size: self.len(),
            });
        }
        let values: Vec<f64> = match self {
            HostStorage::F32(v) => v[start..end].iter().map(|x| x.to_f64()).collect(),
            HostStorage::F64(v) => v[start..end].to_vec(),
            HostStorage::F16(v) => v[start..end].iter().map(|x| x.to_f64()).collect(),
        };
        Ok(match dtype {
            DType::F32 => encode(&values.iter().map(|&x| f32::from_f64(x)).collect::<Vec<_>>()),
            DType::F64 => encode(&values),
            DType::F16 => encode(&values.iter().map(|&x| f16::from_f64(x)).collect::<Vec<_>>()),
        })
    }

    /// Reads elements `start..start + len` widened to f64.
    pub fn to_f64_range(&self, start: usize, len: usize) -> Result<Vec<f64>> {
        let bytes = self.encode_range(start, len, DType::F64)?;
        Ok(crate::dtype::decode(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::decode;

    #[test]
    fn test_from_elements() {
        let s = HostStorage::from_elements(&[1.0f32, 2.0, 3.0]);
        assert_eq!(s.len(), 3);
        assert!(!s.is_empty());
        assert_eq!(s.dtype(), DType::F32);
    }

    #[test]
    fn test_zeros() {
        let s = HostStorage::zeros(DType::F64, 5);
        assert_eq!(s, HostStorage::F64(vec![0.0; 5]));
        assert_eq!(HostStorage::zeros(DType::F16, 2).len(), 2);
    }

    #[test]
    fn test_encode_range_converts() {
        let s = HostStorage::from_elements(&[1.0f64, 2.5, 4.0]);
        let bytes = s.encode_range(1, 2, DType::F32).unwrap();
        assert_eq!(decode::<f32>(&bytes), vec![2.5, 4.0]);
    }

    #[test]
    fn test_encode_range_out_of_bounds() {
        let s = HostStorage::from_elements(&[1.0f32]);
        assert!(matches!(
            s.encode_range(0, 2, DType::F32),
            Err(TensorError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_f16_storage_widens() {
        let s = HostStorage::from_elements(&[f16::from_f32(0.25)]);
        assert_eq!(s.to_f64_range(0, 1).unwrap(), vec![0.25]);
    }
}
