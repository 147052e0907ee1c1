//! Model module: the classifier interface used by every stage
//!
//! This module provides:
//! - The `OpenSetNet` trait, splitting a network into `feature` and `classifier`
//! - Two backbones: a small CNN for image tensors and an MLP for feature vectors
//! - Best-weight snapshots and recorder-based persistence
//! - Run configuration

pub mod cnn;
pub mod config;
pub mod mlp;

use std::path::Path;

use burn::{
    module::{Module, ModuleVisitor},
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};
use tracing::{debug, info};

use crate::utils::error::{OpenSetError, Result};

pub use cnn::{CnnNet, CnnNetConfig};
pub use config::{ModelConfig, PipelineConfig};
pub use mlp::{MlpNet, MlpNetConfig};

/// A classifier that exposes its feature extractor and classifier head separately.
///
/// The centroid calibrator works on `feature` outputs, while training and the
/// confidence gate work on `classifier` logits.
pub trait OpenSetNet<B: Backend>: Module<B> {
    /// Map a batch `[N, C, H, W]` to feature vectors `[N, feature_dim]`
    fn feature(&self, input: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Map feature vectors to logits `[N, num_classes]`
    fn classifier(&self, features: Tensor<B, 2>) -> Tensor<B, 2>;

    fn feature_dim(&self) -> usize;

    fn num_classes(&self) -> usize;

    /// Visit every normalization sub-module. These parameters are exempt from
    /// the EMA teacher's decoupled weight decay.
    fn visit_norm_layers<V: ModuleVisitor<B>>(&self, visitor: &mut V);

    /// Logits for a batch of inputs
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.feature(input);
        self.classifier(features)
    }
}

/// Snapshot of the best weights seen so far, with the score that earned it.
///
/// Only `save` touches disk, so a stage writes its best snapshot once at the end
/// instead of after every improvement.
#[derive(Debug, Clone)]
pub struct BestWeights<M> {
    weights: Option<M>,
    score: f64,
    epoch: usize,
}

impl<M> Default for BestWeights<M> {
    fn default() -> Self {
        Self {
            weights: None,
            score: f64::NEG_INFINITY,
            epoch: 0,
        }
    }
}

impl<M: Clone> BestWeights<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a copy of `model` if `score` beats the current best. Returns true on
    /// improvement.
    pub fn update_best(&mut self, model: &M, score: f64, epoch: usize) -> bool {
        if self.weights.is_none() || score > self.score {
            if self.weights.is_some() {
                info!(
                    "Updating best weights: {:.2}% -> {:.2}% (epoch {})",
                    self.score * 100.0,
                    score * 100.0,
                    epoch + 1
                );
            }
            self.weights = Some(model.clone());
            self.score = score;
            self.epoch = epoch;
            true
        } else {
            debug!(
                "No improvement at epoch {} ({:.2}% <= {:.2}%)",
                epoch + 1,
                score * 100.0,
                self.score * 100.0
            );
            false
        }
    }

    pub fn best(&self) -> Option<&M> {
        self.weights.as_ref()
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Copy of the best weights to continue from, or `current` if no snapshot was taken
    pub fn revert(&self, current: M) -> M {
        self.weights.clone().unwrap_or(current)
    }
}

/// Save a module with burn's `CompactRecorder`
pub fn save_weights<B: Backend, M: Module<B>>(model: &M, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    info!("Saving weights to {:?}", path);
    model
        .clone()
        .save_file(path.to_path_buf(), &CompactRecorder::new())
        .map_err(|e| OpenSetError::checkpoint(path, e))
}

/// Load weights saved by [`save_weights`] into a module of the same topology
pub fn load_weights<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<M> {
    info!("Loading weights from {:?}", path);
    model
        .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
        .map_err(|e| OpenSetError::checkpoint(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_weights_keeps_highest_score() {
        let mut best = BestWeights::new();
        assert!(best.update_best(&"a", 0.5, 0));
        assert!(!best.update_best(&"b", 0.4, 1));
        assert!(!best.update_best(&"c", 0.5, 2));
        assert!(best.update_best(&"d", 0.7, 3));

        assert_eq!(best.best(), Some(&"d"));
        assert_eq!(best.epoch(), 3);
        assert_eq!(best.score(), 0.7);
    }

    #[test]
    fn test_first_snapshot_always_taken() {
        let mut best = BestWeights::new();
        assert!(best.update_best(&1, 0.0, 0));
        assert_eq!(best.revert(5), 1);

        let empty: BestWeights<i32> = BestWeights::new();
        assert_eq!(empty.revert(7), 7);
    }
}
