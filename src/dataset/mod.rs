//! Dataset module: in-memory datasets, batchers, loaders and the class index
//!
//! This module provides:
//! - `ClassIndex`: dataset-native category ids to dense class ids
//! - `InMemoryDataset` implementing Burn's `Dataset`, with labeled and weak/strong batchers
//! - `BatchLoader` / `CyclingLoader` for shuffled epochs and wrap-around iteration
//! - A synthetic season-shift generator
//! - Weak/strong augmentation

pub mod augmentation;
pub mod burn_dataset;
pub mod loader;
pub mod synthetic;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::{OpenSetError, Result};
use crate::UNKNOWN_CLASS;

pub use augmentation::{AugmentationConfig, Augmenter};
pub use burn_dataset::{
    InMemoryDataset, LabeledBatch, LabeledBatcher, PairBatcher, SampleItem, UnlabeledBatch,
};
pub use loader::{BatchLoader, CyclingLoader};
pub use synthetic::{SeasonShiftConfig, SeasonShiftData};

/// Loader of labeled batches on backend `B`
pub type LabeledLoader<B> = BatchLoader<SampleItem, LabeledBatch<B>>;

/// Never-ending loader of weak/strong pairs on backend `B`
pub type PairLoader<B> = CyclingLoader<SampleItem, UnlabeledBatch<B>>;

/// Fixed mapping from dataset-native category ids to dense class ids.
///
/// Categories may also map to -1 (a declared unknown category kept in evaluation
/// splits) or be excluded, in which case loaders drop them before lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassIndex {
    mapping: BTreeMap<u64, i64>,
    #[serde(default)]
    excluded: BTreeSet<u64>,
}

impl ClassIndex {
    /// Map `categories` in order onto `0..categories.len()`
    pub fn new(categories: &[u64]) -> Self {
        let mapping = categories
            .iter()
            .enumerate()
            .map(|(i, &category)| (category, i as i64))
            .collect();
        Self {
            mapping,
            excluded: BTreeSet::new(),
        }
    }

    /// Drop these categories at load time
    pub fn with_excluded(mut self, categories: &[u64]) -> Self {
        self.excluded.extend(categories.iter().copied());
        self
    }

    /// Map these categories to the unknown label
    pub fn with_unknown(mut self, categories: &[u64]) -> Self {
        for &category in categories {
            self.mapping.insert(category, UNKNOWN_CLASS);
        }
        self
    }

    /// Number of dense known classes
    pub fn num_classes(&self) -> usize {
        self.mapping.values().filter(|&&v| v != UNKNOWN_CLASS).count()
    }

    pub fn is_excluded(&self, category: u64) -> bool {
        self.excluded.contains(&category)
    }

    /// Dense id for `category`. Excluded categories give `None`; anything else
    /// missing from the mapping is a fatal error.
    pub fn lookup(&self, category: u64) -> Result<Option<i64>> {
        if self.is_excluded(category) {
            return Ok(None);
        }
        self.mapping
            .get(&category)
            .copied()
            .map(Some)
            .ok_or(OpenSetError::UnknownCategory(category))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
