//! Batch loaders
//!
//! `BatchLoader` turns a dataset and a batcher into one shuffled pass of
//! batches per call to [`BatchLoader::iter`]. `CyclingLoader` wraps a loader
//! and starts a fresh, reshuffled pass whenever the current one runs out, so
//! two sources with different lengths can be drawn in lock-step.

use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// Shuffled epoch-by-epoch batching over a dataset
pub struct BatchLoader<I, O> {
    dataset: Arc<dyn Dataset<I>>,
    batcher: Arc<dyn Batcher<I, O>>,
    batch_size: usize,
    rng: Option<ChaCha8Rng>,
}

impl<I, O> BatchLoader<I, O> {
    /// Sequential loader (no shuffling)
    pub fn new<D, T>(dataset: D, batcher: T, batch_size: usize) -> Self
    where
        D: Dataset<I> + 'static,
        T: Batcher<I, O> + 'static,
    {
        Self {
            dataset: Arc::new(dataset),
            batcher: Arc::new(batcher),
            batch_size: batch_size.max(1),
            rng: None,
        }
    }

    /// Reshuffle the item order at the start of every pass
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.rng = Some(ChaCha8Rng::seed_from_u64(seed));
        self
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per pass, counting a final partial batch
    pub fn num_batches(&self) -> usize {
        (self.len() + self.batch_size - 1) / self.batch_size
    }

    /// Start a new pass over the dataset
    pub fn iter(&mut self) -> EpochIter<I, O> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            order.shuffle(rng);
        }
        EpochIter {
            dataset: Arc::clone(&self.dataset),
            batcher: Arc::clone(&self.batcher),
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

/// One pass over a dataset, yielding batches lazily
pub struct EpochIter<I, O> {
    dataset: Arc<dyn Dataset<I>>,
    batcher: Arc<dyn Batcher<I, O>>,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl<I, O> Iterator for EpochIter<I, O> {
    type Item = O;

    fn next(&mut self) -> Option<O> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let items: Vec<I> = self.order[self.cursor..end]
            .iter()
            .filter_map(|&i| self.dataset.get(i))
            .collect();
        self.cursor = end;
        Some(self.batcher.batch(items))
    }
}

/// A loader that never runs dry: exhausting a pass starts the next one.
///
/// `next` only returns `None` when the underlying dataset is empty.
pub struct CyclingLoader<I, O> {
    loader: BatchLoader<I, O>,
    current: EpochIter<I, O>,
    restarts: usize,
}

impl<I, O> CyclingLoader<I, O> {
    pub fn new(mut loader: BatchLoader<I, O>) -> Self {
        let current = loader.iter();
        Self {
            loader,
            current,
            restarts: 0,
        }
    }

    /// Number of times a pass was exhausted and restarted
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    pub fn num_batches(&self) -> usize {
        self.loader.num_batches()
    }
}

impl<I, O> Iterator for CyclingLoader<I, O> {
    type Item = O;

    fn next(&mut self) -> Option<O> {
        if let Some(batch) = self.current.next() {
            return Some(batch);
        }
        if self.loader.is_empty() {
            return None;
        }
        self.current = self.loader.iter();
        self.restarts += 1;
        debug!("Restarting cycling loader (restart {})", self.restarts);
        self.current.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::data::dataset::InMemDataset;

    #[derive(Clone)]
    struct CollectBatcher;

    impl Batcher<usize, Vec<usize>> for CollectBatcher {
        fn batch(&self, items: Vec<usize>) -> Vec<usize> {
            items
        }
    }

    fn loader(n: usize, batch_size: usize) -> BatchLoader<usize, Vec<usize>> {
        BatchLoader::new(InMemDataset::new((0..n).collect()), CollectBatcher, batch_size)
    }

    #[test]
    fn test_pass_covers_every_item_once() {
        let mut loader = loader(5, 2).shuffled(1);
        assert_eq!(loader.num_batches(), 3);

        let batches: Vec<Vec<usize>> = loader.iter().collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 1);

        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unshuffled_order_is_sequential() {
        let mut loader = loader(4, 3);
        let batches: Vec<Vec<usize>> = loader.iter().collect();
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn test_cycling_loader_restarts_on_exhaustion() {
        let mut cycling = CyclingLoader::new(loader(5, 2).shuffled(3));
        assert_eq!(cycling.restarts(), 0);

        // three batches per pass: batches 4 and 7 trigger restarts
        let drawn: Vec<Vec<usize>> = cycling.by_ref().take(7).collect();
        assert_eq!(drawn.len(), 7);
        assert_eq!(cycling.restarts(), 2);

        let mut second_pass: Vec<usize> = drawn[3..6].iter().flatten().copied().collect();
        second_pass.sort_unstable();
        assert_eq!(second_pass, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cycling_loader_on_empty_dataset() {
        let mut cycling = CyclingLoader::new(loader(0, 4));
        assert!(cycling.next().is_none());
        assert_eq!(cycling.restarts(), 0);
    }
}
