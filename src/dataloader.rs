//! Data loader

use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

use crate::tensor::Tensor;

/// Errors for the dataloader
#[derive(Debug, Error, PartialEq)]
pub enum DataLoaderError {
    #[error("{pixels} pixels do not split into whole images of shape {image_shape:?}")]
    ImageSizeMismatch {
        pixels: usize,
        image_shape: [usize; 3],
    },
    #[error("{images} images but {labels} labels")]
    LabelLengthMismatch { images: usize, labels: usize },
    #[error("Label {label} is out of range for {num_classes} classes")]
    LabelOutOfRange { label: u8, num_classes: usize },
    #[error("Batch size must be positive")]
    ZeroBatchSize,
    #[error("Batch size {batch_size} is larger than the dataset ({len} examples)")]
    BatchLargerThanDataset { batch_size: usize, len: usize },
    #[error("Batch size {batch_size} must be divisible by the number of devices ({devices})")]
    NotDivisible { batch_size: usize, devices: usize },
}

/// Images with one integer label each, pixels stored `[N, H, W, C]` in `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDataset {
    images: Vec<f32>,
    labels: Vec<u8>,
    image_shape: [usize; 3],
    num_classes: usize,
}

impl ImageDataset {
    pub fn new(
        images: Vec<f32>,
        labels: Vec<u8>,
        image_shape: [usize; 3],
        num_classes: usize,
    ) -> Result<Self, DataLoaderError> {
        let image_len = image_shape.iter().product::<usize>();
        if image_len == 0 || images.len() % image_len != 0 {
            return Err(DataLoaderError::ImageSizeMismatch {
                pixels: images.len(),
                image_shape,
            });
        }
        if images.len() / image_len != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                images: images.len() / image_len,
                labels: labels.len(),
            });
        }
        if let Some(&label) = labels.iter().find(|&&l| l as usize >= num_classes) {
            return Err(DataLoaderError::LabelOutOfRange { label, num_classes });
        }
        Ok(Self {
            images,
            labels,
            image_shape,
            num_classes,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn image_shape(&self) -> [usize; 3] {
        self.image_shape
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    fn image_len(&self) -> usize {
        self.image_shape.iter().product()
    }

    /// Gathers the examples at `indices` into one batch
    pub fn batch(&self, indices: &[usize]) -> Batch {
        let image_len = self.image_len();
        let mut images = Vec::with_capacity(indices.len() * image_len);
        for &i in indices {
            images.extend_from_slice(&self.images[i * image_len..(i + 1) * image_len]);
        }
        let [h, w, c] = self.image_shape;
        Batch {
            images: Tensor::from_raw(vec![indices.len(), h, w, c], images),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Consecutive batches of `size` in dataset order, the last one may be smaller
    pub fn chunks(&self, size: usize) -> Result<impl Iterator<Item = Batch> + '_, DataLoaderError> {
        if size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        Ok((0..self.len()).step_by(size).map(move |start| {
            let indices = (start..(start + size).min(self.len())).collect::<Vec<_>>();
            self.batch(&indices)
        }))
    }
}

/// A mini batch of images and their labels
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Vec<u8>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Splits the batch into `n` equally sized consecutive shards, one per device
    pub fn shard(self, n: usize) -> Result<Vec<Batch>, DataLoaderError> {
        if n == 0 || self.is_empty() || self.len() % n != 0 {
            return Err(DataLoaderError::NotDivisible {
                batch_size: self.len(),
                devices: n,
            });
        }
        let per_shard = self.len() / n;
        let mut shape = self.images.shape().to_vec();
        shape[0] = per_shard;
        let image_len = self.images.len() / self.len().max(1);

        Ok(self
            .images
            .data()
            .chunks(per_shard * image_len)
            .zip(self.labels.chunks(per_shard))
            .map(|(images, labels)| Batch {
                images: Tensor::from_raw(shape.clone(), images.to_vec()),
                labels: labels.to_vec(),
            })
            .collect())
    }
}

/// Data loader, returns shuffled batches for one pass over the dataset
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
///
/// The incomplete final batch is skipped so every step sees `batch_size` examples.
pub struct DataLoader<'a> {
    dataset: &'a ImageDataset,
    batch_size: usize,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a ImageDataset, batch_size: usize) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        if batch_size > dataset.len() {
            return Err(DataLoaderError::BatchLargerThanDataset {
                batch_size,
                len: dataset.len(),
            });
        }
        Ok(Self {
            dataset,
            batch_size,
        })
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    /// Draws a fresh permutation from `rng`, one call per epoch
    pub fn iter<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIterator<'a> {
        let mut indices = (0..self.dataset.len()).collect::<Vec<_>>();
        indices.shuffle(rng);
        indices.truncate(self.steps_per_epoch() * self.batch_size);
        DataLoaderIterator {
            dataset: self.dataset,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches until the end of the permutation
pub struct DataLoaderIterator<'a> {
    dataset: &'a ImageDataset,
    batch_size: usize,
    // shuffled indices, truncated to whole batches
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter + self.batch_size > self.indices.len() {
            return None;
        }
        let batch = self
            .dataset
            .batch(&self.indices[self.curr_iter..self.curr_iter + self.batch_size]);
        self.curr_iter += self.batch_size;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    /// `n` 1x2 single channel images where image `i` is `[i, i]`
    fn dataset(n: usize) -> ImageDataset {
        let images = (0..n).flat_map(|i| [i as f32, i as f32]).collect();
        let labels = (0..n).map(|i| (i % 3) as u8).collect();
        ImageDataset::new(images, labels, [1, 2, 1], 3).unwrap()
    }

    #[test]
    fn test_dataset_errors() {
        assert_eq!(
            ImageDataset::new(vec![0.0; 3], vec![0, 1], [1, 2, 1], 2),
            Err(DataLoaderError::ImageSizeMismatch {
                pixels: 3,
                image_shape: [1, 2, 1]
            })
        );
        assert_eq!(
            ImageDataset::new(vec![0.0; 6], vec![0, 1], [1, 2, 1], 2),
            Err(DataLoaderError::LabelLengthMismatch {
                images: 3,
                labels: 2
            })
        );
        assert_eq!(
            ImageDataset::new(vec![0.0; 4], vec![0, 5], [1, 2, 1], 2),
            Err(DataLoaderError::LabelOutOfRange {
                label: 5,
                num_classes: 2
            })
        );
    }

    #[test]
    fn test_dataloader_skips_incomplete_batch() {
        let ds = dataset(7);
        let loader = DataLoader::new(&ds, 3).unwrap();
        assert_eq!(loader.steps_per_epoch(), 2);

        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let batches = loader.iter(&mut rng).collect::<Vec<_>>();
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert_eq!(batch.images.shape(), &[3, 1, 2, 1]);
            assert_eq!(batch.len(), 3);
            // image and label stay paired
            for (pixels, &label) in batch.images.data().chunks(2).zip(&batch.labels) {
                assert_eq!(pixels[0] as usize % 3, label as usize);
            }
        }

        // no example is drawn twice within an epoch
        let mut seen = batches
            .iter()
            .flat_map(|b| b.images.data().chunks(2).map(|p| p[0] as usize).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_dataloader_shuffle_is_seeded() {
        let ds = dataset(10);
        let loader = DataLoader::new(&ds, 5).unwrap();
        let epoch = |seed| {
            let mut rng = Pcg64Mcg::seed_from_u64(seed);
            loader.iter(&mut rng).collect::<Vec<_>>()
        };
        assert_eq!(epoch(42), epoch(42));

        // one rng carried across epochs gives a different order each epoch
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let first = loader.iter(&mut rng).collect::<Vec<_>>();
        let second = loader.iter(&mut rng).collect::<Vec<_>>();
        assert_ne!(first, second);
    }

    #[test]
    fn test_dataloader_errors() {
        let ds = dataset(4);
        assert!(matches!(
            DataLoader::new(&ds, 0),
            Err(DataLoaderError::ZeroBatchSize)
        ));
        assert!(matches!(
            DataLoader::new(&ds, 5),
            Err(DataLoaderError::BatchLargerThanDataset {
                batch_size: 5,
                len: 4
            })
        ));
    }

    #[test]
    fn test_shard() {
        let ds = dataset(6);
        let batch = ds.batch(&[0, 1, 2, 3, 4, 5]);
        let shards = batch.clone().shard(3).unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[1].images.shape(), &[2, 1, 2, 1]);
        assert_eq!(shards[1].images.data(), &[2.0, 2.0, 3.0, 3.0]);
        assert_eq!(shards[2].labels, vec![1, 2]);

        assert_eq!(
            batch.shard(4),
            Err(DataLoaderError::NotDivisible {
                batch_size: 6,
                devices: 4
            })
        );
    }

    #[test]
    fn test_chunks_keep_the_remainder() {
        let ds = dataset(5);
        let sizes = ds.chunks(2).unwrap().map(|b| b.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![2, 2, 1]);
        let first = ds.chunks(2).unwrap().next().unwrap();
        assert_eq!(first.labels, vec![0, 1]);
    }

    #[test]
    fn test_chunks_reject_zero_size() {
        let ds = dataset(3);
        assert!(matches!(ds.chunks(0), Err(DataLoaderError::ZeroBatchSize)));
    }
}
