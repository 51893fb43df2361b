use std::ops::Range;

use gr_tensor::{DType, Element, HostStorage, TensorError};

use crate::error::{Result, TrainError};

/// Builds datasets with a fixed row layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLoader {
    dtype: DType,
    ne_feature: usize,
    ne_label: usize,
    shard_size: usize,
}

impl DataLoader {
    /// Rows have `ne_feature` feature and `ne_label` label elements of
    /// `dtype`, grouped into shards of `shard_size` rows.
    pub fn new(dtype: DType, ne_feature: usize, ne_label: usize, shard_size: usize) -> Self {
        DataLoader {
            dtype,
            ne_feature,
            ne_label,
            shard_size,
        }
    }

    /// Copies `features` and `labels` (row-major, one row after another)
    /// into host storage.
    pub fn load<T: Element>(&self, features: &[T], labels: &[T]) -> Result<Dataset> {
        if self.ne_feature == 0 || self.ne_label == 0 || self.shard_size == 0 {
            return Err(TensorError::InvalidShape {
                dims: vec![self.ne_feature, self.ne_label, self.shard_size],
            }
            .into());
        }
        if T::DTYPE != self.dtype {
            return Err(TensorError::TypeMismatch {
                expected: self.dtype,
                got: T::DTYPE,
            }
            .into());
        }
        let ndata = features.len() / self.ne_feature;
        if features.len() % self.ne_feature != 0 || labels.len() != ndata * self.ne_label {
            return Err(TensorError::ShapeMismatch {
                op: "load dataset".to_string(),
                expected: vec![ndata * self.ne_feature, ndata * self.ne_label],
                got: vec![features.len(), labels.len()],
            }
            .into());
        }
        if ndata == 0 {
            return Err(TrainError::EmptyDataset);
        }
        Ok(Dataset {
            features: HostStorage::from_elements(features),
            labels: HostStorage::from_elements(labels),
            ne_feature: self.ne_feature,
            ne_label: self.ne_label,
            shard_size: self.shard_size,
            ndata,
        })
    }
}

/// Immutable, host-resident (features, labels) rows split into shards.
///
/// The last shard is shorter when `ndata` is not a multiple of the shard
/// size.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: HostStorage,
    labels: HostStorage,
    ne_feature: usize,
    ne_label: usize,
    shard_size: usize,
    ndata: usize,
}

impl Dataset {
    pub fn ndata(&self) -> usize {
        self.ndata
    }

    pub fn nshards(&self) -> usize {
        self.ndata.div_ceil(self.shard_size)
    }

    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    pub fn ne_feature(&self) -> usize {
        self.ne_feature
    }

    pub fn ne_label(&self) -> usize {
        self.ne_label
    }

    pub fn dtype(&self) -> DType {
        self.features.dtype()
    }

    /// Row indices belonging to `shard`.
    pub fn shard_rows(&self, shard: usize) -> Range<usize> {
        let start = (shard * self.shard_size).min(self.ndata);
        start..(start + self.shard_size).min(self.ndata)
    }

    /// Features of `row` encoded as `dtype`.
    pub fn feature_bytes(&self, row: usize, dtype: DType) -> Result<Vec<u8>> {
        Ok(self
            .features
            .encode_range(row * self.ne_feature, self.ne_feature, dtype)?)
    }

    /// Labels of `row` encoded as `dtype`.
    pub fn label_bytes(&self, row: usize, dtype: DType) -> Result<Vec<u8>> {
        Ok(self
            .labels
            .encode_range(row * self.ne_label, self.ne_label, dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gr_tensor::dtype::decode;
    use half::f16;

    #[test]
    fn test_load_and_shards() {
        let loader = DataLoader::new(DType::F32, 2, 1, 2);
        let features: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let labels: Vec<f32> = (0..5).map(|i| i as f32 * 10.0).collect();
        let data = loader.load(&features, &labels).unwrap();
        assert_eq!(data.ndata(), 5);
        assert_eq!(data.nshards(), 3);
        assert_eq!(data.shard_rows(1), 2..4);
        assert_eq!(data.shard_rows(2), 4..5);
        assert_eq!(decode::<f32>(&data.feature_bytes(3, DType::F32).unwrap()), vec![6.0, 7.0]);
        assert_eq!(decode::<f64>(&data.label_bytes(4, DType::F64).unwrap()), vec![40.0]);
    }

    #[test]
    fn test_type_mismatch() {
        let loader = DataLoader::new(DType::F32, 1, 1, 1);
        assert!(matches!(
            loader.load(&[1.0f64], &[2.0f64]),
            Err(TrainError::Tensor(TensorError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_inconsistent_lengths() {
        let loader = DataLoader::new(DType::F64, 2, 1, 1);
        assert!(matches!(
            loader.load(&[1.0f64, 2.0, 3.0], &[1.0f64]),
            Err(TrainError::Tensor(TensorError::ShapeMismatch { .. }))
        ));
        assert!(matches!(
            loader.load(&[1.0f64, 2.0], &[1.0f64, 2.0]),
            Err(TrainError::Tensor(TensorError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn test_zero_sizes_and_empty() {
        let loader = DataLoader::new(DType::F64, 0, 1, 1);
        assert!(matches!(
            loader.load::<f64>(&[], &[]),
            Err(TrainError::Tensor(TensorError::InvalidShape { .. }))
        ));
        let loader = DataLoader::new(DType::F64, 1, 1, 1);
        assert!(matches!(
            loader.load::<f64>(&[], &[]),
            Err(TrainError::EmptyDataset)
        ));
    }

    #[test]
    fn test_half_storage_widens() {
        let loader = DataLoader::new(DType::F16, 1, 1, 4);
        let xs = [f16::from_f32(0.5), f16::from_f32(1.5)];
        let ys = [f16::from_f32(2.0), f16::from_f32(-1.0)];
        let data = loader.load(&xs, &ys).unwrap();
        assert_eq!(data.dtype(), DType::F16);
        assert_eq!(data.nshards(), 1);
        assert_eq!(decode::<f32>(&data.feature_bytes(1, DType::F32).unwrap()), vec![1.5]);
        assert_eq!(decode::<f32>(&data.label_bytes(1, DType::F32).unwrap()), vec![-1.0]);
    }
}
