use std::path::Path;

use candle_core::{safetensors, DType, Device, Tensor};

use crate::config::{to_runtime_error, TrainingError};

/// Finite, restartable sequence of `(images, labels)` batches over a pair of
/// in-memory tensors. Every call to `iter` restarts the pass; the trailing
/// partial batch is kept.
pub struct TensorBatches {
    images: Tensor,
    labels: Tensor,
    batch_size: usize,
}

impl TensorBatches {
    pub fn new(images: Tensor, labels: Tensor, batch_size: usize) -> Result<Self, TrainingError> {
        if batch_size == 0 {
            return Err(TrainingError::initialization("batch_size must be > 0"));
        }
        let samples = images
            .dims()
            .first()
            .copied()
            .ok_or_else(|| TrainingError::initialization("image tensor must be batched"))?;
        if labels.dims() != [samples] {
            return Err(TrainingError::initialization(format!(
                "label tensor shape {:?} does not match {} samples",
                labels.dims(),
                samples
            )));
        }
        if samples == 0 {
            return Err(TrainingError::initialization("dataset must not be empty"));
        }
        let labels = labels.to_dtype(DType::U32).map_err(to_runtime_error)?;
        Ok(Self {
            images,
            labels,
            batch_size,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.images.dims()[0]
    }

    /// Number of batches in one pass.
    pub fn len(&self) -> usize {
        self.num_samples().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            source: self,
            cursor: 0,
        }
    }
}

pub struct BatchIter<'a> {
    source: &'a TensorBatches,
    cursor: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<(Tensor, Tensor), TrainingError>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.source.num_samples();
        if self.cursor >= total {
            return None;
        }
        let start = self.cursor;
        let len = self.source.batch_size.min(total - start);
        self.cursor += len;
        let batch = self
            .source
            .images
            .narrow(0, start, len)
            .and_then(|images| {
                let labels = self.source.labels.narrow(0, start, len)?;
                Ok((images, labels))
            })
            .map_err(to_runtime_error);
        Some(batch)
    }
}

/// Train/validation loader pair consumed by the trainer and the calibrator.
pub struct ImageDataset {
    pub train: TensorBatches,
    pub valid: TensorBatches,
}

impl ImageDataset {
    /// Reads `train_images`/`train_labels`/`valid_images`/`valid_labels`
    /// from a single safetensors file and places them on `device`.
    pub fn from_safetensors(
        path: impl AsRef<Path>,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TrainingError::initialization(format!(
                "dataset file {} does not exist",
                path.display()
            )));
        }
        let tensors = safetensors::load(path, device).map_err(to_runtime_error)?;
        let mut fetch = |name: &str| {
            tensors.get(name).cloned().ok_or_else(|| {
                TrainingError::initialization(format!(
                    "dataset file {} is missing tensor '{}'",
                    path.display(),
                    name
                ))
            })
        };
        let train = TensorBatches::new(fetch("train_images")?, fetch("train_labels")?, batch_size)?;
        let valid = TensorBatches::new(fetch("valid_images")?, fetch("valid_labels")?, batch_size)?;
        Ok(Self { train, valid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn loader(samples: usize, batch_size: usize) -> TensorBatches {
        let device = Device::Cpu;
        let images = Tensor::zeros((samples, 3, 4, 4), DType::F32, &device).expect("images");
        let labels = Tensor::zeros(samples, DType::U32, &device).expect("labels");
        TensorBatches::new(images, labels, batch_size).expect("loader")
    }

    #[test]
    fn trailing_partial_batch_is_kept() {
        let batches = loader(10, 4);
        assert_eq!(batches.len(), 3);
        let sizes: Vec<usize> = batches
            .iter()
            .map(|batch| batch.expect("batch").0.dims()[0])
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn iteration_restarts_from_the_beginning() {
        let batches = loader(6, 3);
        assert_eq!(batches.iter().count(), 2);
        assert_eq!(batches.iter().count(), 2);
    }

    #[test]
    fn mismatched_labels_are_rejected() {
        let device = Device::Cpu;
        let images = Tensor::zeros((4, 3, 4, 4), DType::F32, &device).expect("images");
        let labels = Tensor::zeros(3, DType::U32, &device).expect("labels");
        assert!(TensorBatches::new(images, labels, 2).is_err());
    }
}
