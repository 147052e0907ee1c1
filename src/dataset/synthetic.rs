//! Synthetic season-shift data
//!
//! Generates a separable `K`-class problem as `[D, 1, 1]` feature vectors:
//! class `k` sits at `separation * e_k`, the target season is offset along
//! dimension `K`, and out-of-distribution examples lie far out along dimension
//! `K + 1` with label -1.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::burn_dataset::{InMemoryDataset, SampleItem};
use crate::utils::error::{OpenSetError, Result};
use crate::UNKNOWN_CLASS;

/// Shape of the generated problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonShiftConfig {
    pub num_classes: usize,
    /// Must be at least `num_classes + 2`
    pub feature_dim: usize,
    pub separation: f32,
    /// Uniform noise amplitude per dimension
    pub noise: f32,
    /// Offset of the target season along dimension `num_classes`
    pub season_shift: f32,
    pub labeled_per_class: usize,
    pub unlabeled_per_class: usize,
    pub test_per_class: usize,
    /// Out-of-distribution examples added to the unlabeled and test splits
    pub ood_count: usize,
    pub ood_distance: f32,
    pub seed: u64,
}

impl Default for SeasonShiftConfig {
    fn default() -> Self {
        Self {
            num_classes: 3,
            feature_dim: 8,
            separation: 3.0,
            noise: 0.3,
            season_shift: 0.5,
            labeled_per_class: 20,
            unlabeled_per_class: 100,
            test_per_class: 50,
            ood_count: 30,
            ood_distance: 25.0,
            seed: 42,
        }
    }
}

/// Source-season labeled data, target-season unlabeled data and held-out splits
#[derive(Debug, Clone)]
pub struct SeasonShiftData {
    pub labeled: InMemoryDataset,
    /// Target season; labels are ground truth kept only for logging
    pub unlabeled: InMemoryDataset,
    /// Target-season, in-distribution only
    pub validation: InMemoryDataset,
    /// Target season including out-of-distribution examples
    pub test: InMemoryDataset,
}

impl SeasonShiftData {
    pub fn generate(config: &SeasonShiftConfig) -> Result<Self> {
        if config.feature_dim < config.num_classes + 2 {
            return Err(OpenSetError::Config(format!(
                "feature_dim {} must be at least num_classes + 2 = {}",
                config.feature_dim,
                config.num_classes + 2
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let shape = [config.feature_dim, 1, 1];

        let labeled = Self::known(config, config.labeled_per_class, 0.0, &mut rng);
        let mut unlabeled = Self::known(config, config.unlabeled_per_class, config.season_shift, &mut rng);
        unlabeled.extend(Self::ood(config, &mut rng));
        let validation = Self::known(config, config.test_per_class, config.season_shift, &mut rng);
        let mut test = Self::known(config, config.test_per_class, config.season_shift, &mut rng);
        test.extend(Self::ood(config, &mut rng));

        info!(
            "Generated season-shift data: {} labeled, {} unlabeled, {} validation, {} test",
            labeled.len(),
            unlabeled.len(),
            validation.len(),
            test.len()
        );

        Ok(Self {
            labeled: InMemoryDataset::new(labeled, shape)?,
            unlabeled: InMemoryDataset::new(unlabeled, shape)?,
            validation: InMemoryDataset::new(validation, shape)?,
            test: InMemoryDataset::new(test, shape)?,
        })
    }

    fn known(config: &SeasonShiftConfig, per_class: usize, shift: f32, rng: &mut ChaCha8Rng) -> Vec<SampleItem> {
        let mut items = Vec::with_capacity(per_class * config.num_classes);
        for class in 0..config.num_classes {
            for _ in 0..per_class {
                let mut x = noise_vector(config.feature_dim, config.noise, rng);
                x[class] += config.separation;
                x[config.num_classes] += shift;
                items.push(SampleItem::new(x, class as i64));
            }
        }
        items
    }

    fn ood(config: &SeasonShiftConfig, rng: &mut ChaCha8Rng) -> Vec<SampleItem> {
        (0..config.ood_count)
            .map(|_| {
                let mut x = noise_vector(config.feature_dim, config.noise, rng);
                x[config.num_classes + 1] += config.ood_distance;
                SampleItem::new(x, UNKNOWN_CLASS)
            })
            .collect()
    }
}

fn noise_vector(dim: usize, amplitude: f32, rng: &mut ChaCha8Rng) -> Vec<f32> {
    if amplitude <= 0.0 {
        return vec![0.0; dim];
    }
    (0..dim).map(|_| rng.gen_range(-amplitude..=amplitude)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sizes_and_labels() {
        let config = SeasonShiftConfig {
            labeled_per_class: 2,
            unlabeled_per_class: 4,
            test_per_class: 3,
            ood_count: 5,
            ..Default::default()
        };
        let data = SeasonShiftData::generate(&config).unwrap();

        assert_eq!(data.labeled.class_counts(3), vec![2, 2, 2]);
        assert_eq!(data.unlabeled.items().len(), 12 + 5);
        assert_eq!(data.validation.unique_classes(), vec![0, 1, 2]);
        assert_eq!(data.test.unique_classes(), vec![-1, 0, 1, 2]);
    }

    #[test]
    fn test_same_seed_same_data() {
        let config = SeasonShiftConfig::default();
        let a = SeasonShiftData::generate(&config).unwrap();
        let b = SeasonShiftData::generate(&config).unwrap();
        assert_eq!(a.test.items(), b.test.items());
    }

    #[test]
    fn test_feature_dim_too_small() {
        let config = SeasonShiftConfig {
            feature_dim: 4,
            ..Default::default()
        };
        assert!(SeasonShiftData::generate(&config).is_err());
    }
}
