//! Minibatch iteration over a dataset.

use super::dataset::Dataset;
use super::sampler::{BatchSampler, IndexOrder, RandomSampler, SequentialSampler};
use super::{DataError, Result};
use ndarray::ArrayD;

/// One minibatch and the dataset rows it came from.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: ArrayD<f32>,
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Serves a dataset in minibatches, one [`epoch`](DataLoader::epoch) at a
/// time. Sequential by default; [`shuffled`](DataLoader::shuffled) draws a
/// new permutation for every epoch.
#[derive(Debug, Clone)]
pub struct DataLoader<D: Dataset> {
    dataset: D,
    batches: BatchSampler<IndexOrder>,
}

impl<D: Dataset> DataLoader<D> {
    pub fn new(dataset: D, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(DataError::ZeroBatchSize);
        }
        let order = IndexOrder::Sequential(SequentialSampler::new(dataset.len()));
        Ok(Self {
            dataset,
            batches: BatchSampler::new(order, batch_size, false),
        })
    }

    /// Shuffles every epoch, seeded when `seed` is given.
    pub fn shuffled(mut self, seed: Option<u64>) -> Self {
        let n = self.dataset.len();
        let sampler = match seed {
            Some(seed) => RandomSampler::with_seed(n, seed),
            None => RandomSampler::new(n),
        };
        *self.batches.sampler_mut() = IndexOrder::Random(sampler);
        self
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.batches.set_drop_last(drop_last);
        self
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batches.batch_size()
    }

    pub fn num_batches(&self) -> usize {
        self.batches.num_batches()
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Starts a pass over the whole dataset.
    pub fn epoch(&mut self) -> Epoch<'_, D> {
        self.batches.reset();
        Epoch {
            dataset: &self.dataset,
            batches: &mut self.batches,
        }
    }
}

/// Batches of one pass.
pub struct Epoch<'a, D: Dataset> {
    dataset: &'a D,
    batches: &'a mut BatchSampler<IndexOrder>,
}

impl<D: Dataset> Iterator for Epoch<'_, D> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let indices = self.batches.next()?;
        Some(Batch {
            images: self.dataset.gather(&indices),
            indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ImageSet;
    use ndarray::IxDyn;

    fn images(n: usize) -> ImageSet {
        let data = ArrayD::from_shape_vec(IxDyn(&[n, 1, 2, 2]), (0..n * 4).map(|v| v as f32).collect()).unwrap();
        ImageSet::from_array(data, 1, 2).unwrap()
    }

    #[test]
    fn sequential_epoch_keeps_the_short_last_batch() {
        let mut loader = DataLoader::new(images(10), 4).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let sizes: Vec<usize> = loader.epoch().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let first = loader.epoch().next().unwrap();
        assert_eq!(first.indices, vec![0, 1, 2, 3]);
        assert_eq!(first.images.shape(), &[4, 1, 2, 2]);
        assert_eq!(first.images[[3, 0, 1, 1]], 15.0);
    }

    #[test]
    fn shuffled_epochs_cover_every_image_once() {
        let mut loader = DataLoader::new(images(9), 4).unwrap().shuffled(Some(11));
        let mut seen: Vec<usize> = loader.epoch().flat_map(|b| b.indices).collect();
        let second: Vec<usize> = loader.epoch().flat_map(|b| b.indices).collect();
        assert_ne!(seen, second);
        seen.sort_unstable();
        assert_eq!(seen, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn drop_last_and_zero_batch() {
        let mut loader = DataLoader::new(images(10), 4).unwrap().drop_last(true);
        assert_eq!(loader.epoch().count(), 2);
        assert!(matches!(DataLoader::new(images(2), 0), Err(DataError::ZeroBatchSize)));
    }
}
