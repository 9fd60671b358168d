//! Orders in which dataset indices are visited.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// An index stream that can be restarted for the next epoch.
pub trait Sampler: Iterator<Item = usize> {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewinds to the start of a new pass.
    fn reset(&mut self);
}

/// `0, 1, ..., len - 1`.
#[derive(Debug, Clone)]
pub struct SequentialSampler {
    len: usize,
    current: usize,
}

impl SequentialSampler {
    pub fn new(len: usize) -> Self {
        Self { len, current: 0 }
    }
}

impl Iterator for SequentialSampler {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        (self.current < self.len).then(|| {
            self.current += 1;
            self.current - 1
        })
    }
}

impl Sampler for SequentialSampler {
    fn len(&self) -> usize {
        self.len
    }

    fn reset(&mut self) {
        self.current = 0;
    }
}

/// A fresh permutation on every pass. The generator persists across passes,
/// so a seeded sampler yields a reproducible sequence of different orders.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    indices: Vec<usize>,
    current: usize,
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(len: usize) -> Self {
        Self::from_rng(len, StdRng::from_entropy())
    }

    pub fn with_seed(len: usize, seed: u64) -> Self {
        Self::from_rng(len, StdRng::seed_from_u64(seed))
    }

    fn from_rng(len: usize, rng: StdRng) -> Self {
        let mut sampler = Self {
            indices: (0..len).collect(),
            current: 0,
            rng,
        };
        sampler.indices.shuffle(&mut sampler.rng);
        sampler
    }
}

impl Iterator for RandomSampler {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = *self.indices.get(self.current)?;
        self.current += 1;
        Some(idx)
    }
}

impl Sampler for RandomSampler {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn reset(&mut self) {
        self.current = 0;
        self.indices.shuffle(&mut self.rng);
    }
}

/// Either order, chosen when the loader is configured.
#[derive(Debug, Clone)]
pub enum IndexOrder {
    Sequential(SequentialSampler),
    Random(RandomSampler),
}

impl Iterator for IndexOrder {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            IndexOrder::Sequential(s) => s.next(),
            IndexOrder::Random(s) => s.next(),
        }
    }
}

impl Sampler for IndexOrder {
    fn len(&self) -> usize {
        match self {
            IndexOrder::Sequential(s) => s.len(),
            IndexOrder::Random(s) => s.len(),
        }
    }

    fn reset(&mut self) {
        match self {
            IndexOrder::Sequential(s) => s.reset(),
            IndexOrder::Random(s) => s.reset(),
        }
    }
}

/// Groups a sampler's indices into batches of `batch_size`. The last batch
/// may be shorter unless `drop_last` is set.
#[derive(Debug, Clone)]
pub struct BatchSampler<S: Sampler> {
    sampler: S,
    batch_size: usize,
    drop_last: bool,
}

impl<S: Sampler> BatchSampler<S> {
    pub fn new(sampler: S, batch_size: usize, drop_last: bool) -> Self {
        Self {
            sampler,
            batch_size,
            drop_last,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn drop_last(&self) -> bool {
        self.drop_last
    }

    pub fn set_drop_last(&mut self, drop_last: bool) {
        self.drop_last = drop_last;
    }

    pub fn sampler_mut(&mut self) -> &mut S {
        &mut self.sampler
    }

    pub fn num_batches(&self) -> usize {
        let n = self.sampler.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn reset(&mut self) {
        self.sampler.reset();
    }
}

impl<S: Sampler> Iterator for BatchSampler<S> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let batch: Vec<usize> = self.sampler.by_ref().take(self.batch_size).collect();
        if batch.is_empty() || (self.drop_last && batch.len() < self.batch_size) {
            return None;
        }
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_restarts() {
        let mut s = SequentialSampler::new(3);
        assert_eq!(s.by_ref().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(s.next(), None);
        s.reset();
        assert_eq!(s.next(), Some(0));
    }

    #[test]
    fn random_passes_are_permutations_and_differ() {
        let mut s = RandomSampler::with_seed(50, 3);
        let mut first: Vec<usize> = s.by_ref().collect();
        s.reset();
        let mut second: Vec<usize> = s.by_ref().collect();
        assert_ne!(first, second);
        first.sort_unstable();
        second.sort_unstable();
        assert_eq!(first, (0..50).collect::<Vec<_>>());
        assert_eq!(first, second);

        let replay: Vec<usize> = RandomSampler::with_seed(50, 3).collect();
        let again: Vec<usize> = RandomSampler::with_seed(50, 3).collect();
        assert_eq!(replay, again);
    }

    #[test]
    fn batches_keep_the_partial_tail() {
        let batches: Vec<_> = BatchSampler::new(SequentialSampler::new(7), 3, false).collect();
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);

        let dropped = BatchSampler::new(SequentialSampler::new(7), 3, true);
        assert_eq!(dropped.num_batches(), 2);
        assert_eq!(dropped.count(), 2);
    }
}
