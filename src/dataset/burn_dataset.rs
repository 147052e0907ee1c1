//! Burn Dataset Integration
//!
//! In-memory datasets implementing Burn's `Dataset` trait, plus the batchers
//! that turn items into labeled batches and weak/strong unlabeled pairs.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::augmentation::Augmenter;
use super::ClassIndex;
use crate::utils::artifacts;
use crate::utils::error::{OpenSetError, Result};
use crate::UNKNOWN_CLASS;

/// A single example: a flattened CHW input and its dense class id (or -1)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SampleItem {
    pub image: Vec<f32>,
    pub label: i64,
}

impl SampleItem {
    pub fn new(image: Vec<f32>, label: i64) -> Self {
        Self { image, label }
    }
}

/// A fully materialized dataset with a fixed input shape
#[derive(Clone, Debug)]
pub struct InMemoryDataset {
    items: Vec<SampleItem>,
    shape: [usize; 3],
}

impl InMemoryDataset {
    /// Create a dataset, checking that every item matches `shape`
    pub fn new(items: Vec<SampleItem>, shape: [usize; 3]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if let Some(bad) = items.iter().find(|item| item.image.len() != expected) {
            return Err(OpenSetError::shape(
                "dataset item",
                vec![expected],
                vec![bad.image.len()],
            ));
        }
        Ok(Self { items, shape })
    }

    /// Load a dense dump: `features` holds `N * C * H * W` f32 values and
    /// `categories` holds `N` dataset-native category ids (i64). Excluded
    /// categories are dropped; unmapped ones fail the load.
    pub fn from_dump(
        features: &Path,
        categories: &Path,
        shape: [usize; 3],
        class_index: &ClassIndex,
    ) -> Result<Self> {
        let categories = artifacts::read_i64(categories)?;
        let item_len: usize = shape.iter().product();
        let values = artifacts::read_f32(features, categories.len() * item_len)?;

        let mut items = Vec::with_capacity(categories.len());
        for (i, &category) in categories.iter().enumerate() {
            let category = u64::try_from(category).map_err(|_| {
                OpenSetError::Config(format!("negative category id {} at row {}", category, i))
            })?;
            if let Some(label) = class_index.lookup(category)? {
                let image = values[i * item_len..(i + 1) * item_len].to_vec();
                items.push(SampleItem::new(image, label));
            }
        }

        tracing::info!(
            "Loaded {} of {} examples from {:?}",
            items.len(),
            categories.len(),
            features
        );
        Self::new(items, shape)
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn items(&self) -> &[SampleItem] {
        &self.items
    }

    pub fn labels(&self) -> Vec<i64> {
        self.items.iter().map(|item| item.label).collect()
    }

    /// Per-class counts of the current contents; -1 labels are not counted
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0usize; num_classes];
        for item in &self.items {
            if let Ok(idx) = usize::try_from(item.label) {
                if idx < num_classes {
                    counts[idx] += 1;
                }
            }
        }
        counts
    }

    /// Sorted distinct labels, including -1 when present
    pub fn unique_classes(&self) -> Vec<i64> {
        let mut classes: Vec<i64> = self.items.iter().map(|item| item.label).collect();
        classes.sort_unstable();
        classes.dedup();
        classes
    }

    /// Copy of this dataset with every label replaced
    pub fn relabel(&self, labels: &[i64]) -> Result<Self> {
        if labels.len() != self.items.len() {
            return Err(OpenSetError::shape(
                "relabel",
                vec![self.items.len()],
                vec![labels.len()],
            ));
        }
        let items = self
            .items
            .iter()
            .zip(labels)
            .map(|(item, &label)| SampleItem::new(item.image.clone(), label))
            .collect();
        Ok(Self {
            items,
            shape: self.shape,
        })
    }

    /// Keep only the items at `indices`
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            items: indices
                .iter()
                .filter_map(|&i| self.items.get(i).cloned())
                .collect(),
            shape: self.shape,
        }
    }

    /// Concatenate two datasets of the same shape
    pub fn concat(&self, other: &Self) -> Result<Self> {
        if self.shape != other.shape {
            return Err(OpenSetError::shape(
                "dataset concat",
                self.shape.to_vec(),
                other.shape.to_vec(),
            ));
        }
        let mut items = self.items.clone();
        items.extend(other.items.iter().cloned());
        Ok(Self {
            items,
            shape: self.shape,
        })
    }

    /// Items whose label is a known class
    pub fn known_only(&self) -> Self {
        Self {
            items: self
                .items
                .iter()
                .filter(|item| item.label != UNKNOWN_CLASS)
                .cloned()
                .collect(),
            shape: self.shape,
        }
    }
}

impl Dataset<SampleItem> for InMemoryDataset {
    fn get(&self, index: usize) -> Option<SampleItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Stack flattened images into a `[N, C, H, W]` tensor
fn stack_images<B: Backend>(
    images: Vec<f32>,
    batch_size: usize,
    shape: [usize; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    let [c, h, w] = shape;
    Tensor::<B, 4>::from_floats(TensorData::new(images, [batch_size, c, h, w]), device)
}

fn stack_labels<B: Backend>(labels: Vec<i64>, device: &B::Device) -> Tensor<B, 1, Int> {
    let n = labels.len();
    Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [n]), device)
}

/// Per-batch RNG: a base seed plus a counter, so repeated runs see the same views
#[derive(Clone, Debug)]
struct BatchSeed {
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl BatchSeed {
    fn new(seed: u64) -> Self {
        Self {
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_rng(&self) -> ChaCha8Rng {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(n.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }
}

/// Labeled batch for supervised losses and evaluation
#[derive(Clone, Debug)]
pub struct LabeledBatch<B: Backend> {
    /// Inputs [batch_size, C, H, W]
    pub images: Tensor<B, 4>,
    /// Labels [batch_size]; may contain -1 in evaluation splits
    pub targets: Tensor<B, 1, Int>,
}

/// Batcher for labeled batches, optionally augmenting every item
#[derive(Clone, Debug)]
pub struct LabeledBatcher<B: Backend> {
    device: B::Device,
    shape: [usize; 3],
    augmenter: Option<Augmenter>,
    seed: BatchSeed,
}

impl<B: Backend> LabeledBatcher<B> {
    /// Plain batcher (evaluation, calibration)
    pub fn new(device: B::Device, shape: [usize; 3]) -> Self {
        Self {
            device,
            shape,
            augmenter: None,
            seed: BatchSeed::new(0),
        }
    }

    /// Batcher that augments each item with `augmenter`
    pub fn with_augmentation(mut self, augmenter: Augmenter, seed: u64) -> Self {
        self.augmenter = Some(augmenter);
        self.seed = BatchSeed::new(seed);
        self
    }
}

impl<B: Backend> Batcher<SampleItem, LabeledBatch<B>> for LabeledBatcher<B> {
    fn batch(&self, items: Vec<SampleItem>) -> LabeledBatch<B> {
        let batch_size = items.len();
        let mut rng = self.augmenter.as_ref().map(|_| self.seed.next_rng());

        let mut images = Vec::with_capacity(batch_size * self.shape.iter().product::<usize>());
        let mut labels = Vec::with_capacity(batch_size);
        for item in items {
            match (&self.augmenter, rng.as_mut()) {
                (Some(augmenter), Some(rng)) => images.extend(augmenter.augment(&item.image, rng)),
                _ => images.extend_from_slice(&item.image),
            }
            labels.push(item.label);
        }

        LabeledBatch {
            images: stack_images(images, batch_size, self.shape, &self.device),
            targets: stack_labels(labels, &self.device),
        }
    }
}

/// Unlabeled batch of weak/strong views of the same examples
#[derive(Clone, Debug)]
pub struct UnlabeledBatch<B: Backend> {
    pub weak: Tensor<B, 4>,
    pub strong: Tensor<B, 4>,
    /// Held-out labels (or -1); only used for logging pseudo-label accuracy
    pub targets: Tensor<B, 1, Int>,
}

/// Batcher producing a weak and a strong view of every item
#[derive(Clone, Debug)]
pub struct PairBatcher<B: Backend> {
    device: B::Device,
    shape: [usize; 3],
    weak: Augmenter,
    strong: Augmenter,
    seed: BatchSeed,
}

impl<B: Backend> PairBatcher<B> {
    pub fn new(device: B::Device, shape: [usize; 3], weak: Augmenter, strong: Augmenter, seed: u64) -> Self {
        Self {
            device,
            shape,
            weak,
            strong,
            seed: BatchSeed::new(seed),
        }
    }
}

impl<B: Backend> Batcher<SampleItem, UnlabeledBatch<B>> for PairBatcher<B> {
    fn batch(&self, items: Vec<SampleItem>) -> UnlabeledBatch<B> {
        let batch_size = items.len();
        let item_len: usize = self.shape.iter().product();
        let mut rng = self.seed.next_rng();

        let mut weak = Vec::with_capacity(batch_size * item_len);
        let mut strong = Vec::with_capacity(batch_size * item_len);
        let mut labels = Vec::with_capacity(batch_size);
        for item in items {
            weak.extend(self.weak.augment(&item.image, &mut rng));
            strong.extend(self.strong.augment(&item.image, &mut rng));
            labels.push(item.label);
        }

        UnlabeledBatch {
            weak: stack_images(weak, batch_size, self.shape, &self.device),
            strong: stack_images(strong, batch_size, self.shape, &self.device),
            targets: stack_labels(labels, &self.device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::augmentation::AugmentationConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn toy() -> InMemoryDataset {
        let items = vec![
            SampleItem::new(vec![1.0, 0.0], 0),
            SampleItem::new(vec![0.0, 1.0], 1),
            SampleItem::new(vec![1.0, 1.0], 1),
            SampleItem::new(vec![5.0, 5.0], -1),
        ];
        InMemoryDataset::new(items, [2, 1, 1]).unwrap()
    }

    #[test]
    fn test_class_counts_skip_unknown() {
        let ds = toy();
        assert_eq!(ds.class_counts(3), vec![1, 2, 0]);
        assert_eq!(ds.unique_classes(), vec![-1, 0, 1]);
        assert_eq!(ds.known_only().len(), 3);
    }

    #[test]
    fn test_wrong_item_size_rejected() {
        let items = vec![SampleItem::new(vec![1.0; 3], 0)];
        assert!(InMemoryDataset::new(items, [2, 1, 1]).is_err());
    }

    #[test]
    fn test_relabel_replaces_all_labels() {
        let ds = toy().relabel(&[2, 2, -1, 0]).unwrap();
        assert_eq!(ds.labels(), vec![2, 2, -1, 0]);
        assert!(toy().relabel(&[0]).is_err());
    }

    #[test]
    fn test_labeled_batcher_shapes() {
        let device = Default::default();
        let batcher = LabeledBatcher::<TestBackend>::new(device, [2, 1, 1]);
        let batch = batcher.batch(toy().items().to_vec());
        assert_eq!(batch.images.dims(), [4, 2, 1, 1]);
        let labels: Vec<i64> = batch.targets.into_data().to_vec().unwrap();
        assert_eq!(labels, vec![0, 1, 1, -1]);
    }

    #[test]
    fn test_pair_batcher_views_differ_only_by_augmentation() {
        let device = Default::default();
        let shape = [2, 1, 1];
        let batcher = PairBatcher::<TestBackend>::new(
            device,
            shape,
            Augmenter::new(AugmentationConfig::none(), shape),
            Augmenter::new(AugmentationConfig::none(), shape),
            7,
        );
        let batch = batcher.batch(toy().items().to_vec());
        let weak: Vec<f32> = batch.weak.into_data().to_vec().unwrap();
        let strong: Vec<f32> = batch.strong.into_data().to_vec().unwrap();
        assert_eq!(weak, strong);
    }

    #[test]
    fn test_from_dump_maps_and_filters_categories() {
        let dir = tempfile::TempDir::new().unwrap();
        let features = dir.path().join("x.bin");
        let categories = dir.path().join("y.bin");
        artifacts::write_f32(&features, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        artifacts::write_i64(&categories, &[10, 30, 12]).unwrap();

        let index = ClassIndex::new(&[10, 12]).with_excluded(&[30]);
        let ds = InMemoryDataset::from_dump(&features, &categories, [2, 1, 1], &index).unwrap();
        assert_eq!(ds.labels(), vec![0, 1]);
        assert_eq!(ds.items()[1].image, vec![5.0, 6.0]);

        let strict = ClassIndex::new(&[10, 12]);
        assert!(matches!(
            InMemoryDataset::from_dump(&features, &categories, [2, 1, 1], &strict),
            Err(OpenSetError::UnknownCategory(30))
        ));
    }
}
