//! Run Configuration Module
//!
//! Serde configuration structures for the backbone, the optimizer settings of
//! each stage, and the open-set / semi-supervised hyperparameters. The whole
//! tree is saved next to the run outputs as JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::training::scheduler::LrSchedule;
use crate::utils::error::{OpenSetError, Result};

/// Which backbone implementation to build
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BackboneKind {
    /// Flattening MLP, for pre-extracted feature vectors
    #[default]
    Mlp,
    /// Small convolutional network, for image tensors
    Cnn,
}

/// Configuration for the backbone architecture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub backbone: BackboneKind,

    /// Number of known classes
    pub num_classes: usize,

    /// Input layout [channels, height, width]
    pub input_shape: [usize; 3],

    /// Width of the feature vector produced by `feature(x)` (MLP only; the CNN
    /// derives it from `base_filters`)
    pub feature_dim: usize,

    /// Base number of convolutional filters (CNN only)
    pub base_filters: usize,

    /// Dropout rate before the classifier (0.0 to 1.0)
    pub dropout_rate: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneKind::Mlp,
            num_classes: 3,
            input_shape: [8, 1, 1],
            feature_dim: 32,
            base_filters: 16,
            dropout_rate: 0.0,
        }
    }
}

impl ModelConfig {
    /// Flattened input size
    pub fn input_dim(&self) -> usize {
        self.input_shape.iter().product()
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.num_classes == 0 {
            return Err("num_classes must be greater than 0".to_string());
        }
        if self.input_dim() == 0 {
            return Err("input_shape must not contain zero".to_string());
        }
        if self.feature_dim == 0 || self.base_filters == 0 {
            return Err("feature_dim and base_filters must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.dropout_rate) {
            return Err("dropout_rate must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

/// Optimizer and epoch-loop settings of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub epochs: usize,

    /// Batch size (for Stage 2 this is the labeled batch; unlabeled batches use
    /// `batch_size * unlabeled_ratio`)
    pub batch_size: usize,

    /// Initial learning rate
    pub learning_rate: f64,

    /// SGD momentum
    pub momentum: f64,

    /// Weight decay (L2 regularization)
    pub weight_decay: f64,

    /// Learning rate schedule
    pub lr_schedule: LrSchedule,

    /// Log batch statistics every N batches
    pub log_interval: usize,

    /// Random seed for shuffling and augmentation
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 30,
            batch_size: 64,
            learning_rate: 0.01,
            momentum: 0.9,
            weight_decay: 5e-4,
            lr_schedule: LrSchedule::Step {
                step_size: 10,
                gamma: 0.1,
            },
            log_interval: 10,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.epochs == 0 {
            return Err("epochs must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }
        if self.learning_rate <= 0.0 {
            return Err("learning_rate must be positive".to_string());
        }
        if self.log_interval == 0 {
            return Err("log_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Open-set rejection settings shared by evaluation and pseudo-labeling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSetConfig {
    /// Softmax confidence below which a prediction becomes unknown (-1)
    pub threshold: f64,

    /// Numerator of the reachability scale `reachability_scale / d_min`
    pub reachability_scale: f64,

    /// Also persist the calibrated logits as soft pseudo-labels
    pub soft_pseudo_labels: bool,
}

impl Default for OpenSetConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            reachability_scale: 1.0,
            soft_pseudo_labels: false,
        }
    }
}

/// FixMatch consistency and EMA teacher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixMatchConfig {
    /// Weak-view confidence required for an unlabeled example to contribute
    pub threshold: f64,

    /// Weight of the consistency loss
    pub lambda_u: f64,

    /// Unlabeled batch size as a multiple of the labeled batch size
    pub unlabeled_ratio: usize,

    /// Maintain and evaluate with an EMA teacher
    pub use_ema: bool,

    /// EMA decay rate
    pub ema_decay: f64,

    /// Steps per epoch; `None` means one pass over the labeled loader
    pub iterations_per_epoch: Option<usize>,
}

impl Default for FixMatchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.95,
            lambda_u: 1.0,
            unlabeled_ratio: 1,
            use_ema: true,
            ema_decay: 0.999,
            iterations_per_epoch: None,
        }
    }
}

/// Margin loss with effective-number reweighting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginLossConfig {
    /// Effective-number decay β
    pub beta: f64,

    /// Logit scale s
    pub scale: f64,

    /// Largest class margin
    pub max_margin: f64,
}

impl Default for MarginLossConfig {
    fn default() -> Self {
        Self {
            beta: 0.9999,
            scale: 30.0,
            max_margin: 0.3,
        }
    }
}

/// Stage-2 trainer selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Stage2Strategy {
    /// Consistency training over weak/strong pairs, optionally with an EMA teacher
    FixMatch,
    /// Retraining on confident pseudo-labels, optionally with the margin loss
    SelfTraining { margin_loss: bool },
}

impl Default for Stage2Strategy {
    fn default() -> Self {
        Self::SelfTraining { margin_loss: true }
    }
}

/// How pseudo-labels are produced from a frozen model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PseudoLabelStrategy {
    /// Softmax confidence gate on raw logits
    Confidence,
    /// Reachability-calibrated logits followed by the confidence gate
    #[default]
    Reachability,
}

/// Complete configuration of a two-stage run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    pub stage1: TrainingConfig,
    pub stage2: TrainingConfig,
    pub open_set: OpenSetConfig,
    pub fixmatch: FixMatchConfig,
    pub margin: MarginLossConfig,
    pub stage2_strategy: Stage2Strategy,
    pub pseudo_labels: PseudoLabelStrategy,
    /// Number of pseudo-label / Stage-2 rounds
    pub rounds: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            stage1: TrainingConfig::default(),
            stage2: TrainingConfig {
                lr_schedule: LrSchedule::Constant,
                ..Default::default()
            },
            open_set: OpenSetConfig::default(),
            fixmatch: FixMatchConfig::default(),
            margin: MarginLossConfig::default(),
            stage2_strategy: Stage2Strategy::default(),
            pseudo_labels: PseudoLabelStrategy::default(),
            rounds: 1,
        }
    }
}

impl PipelineConfig {
    /// Validate every section, returning a configuration error on the first failure
    pub fn validate(&self) -> Result<()> {
        self.model.validate().map_err(OpenSetError::Config)?;
        self.stage1
            .validate()
            .map_err(|e| OpenSetError::Config(format!("stage1: {}", e)))?;
        self.stage2
            .validate()
            .map_err(|e| OpenSetError::Config(format!("stage2: {}", e)))?;

        let unit = 0.0..=1.0;
        if !unit.contains(&self.open_set.threshold) {
            return Err(OpenSetError::Config(
                "open_set.threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.open_set.reachability_scale <= 0.0 {
            return Err(OpenSetError::Config(
                "open_set.reachability_scale must be positive".to_string(),
            ));
        }
        if !unit.contains(&self.fixmatch.threshold) || !unit.contains(&self.fixmatch.ema_decay) {
            return Err(OpenSetError::Config(
                "fixmatch.threshold and fixmatch.ema_decay must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.fixmatch.unlabeled_ratio == 0 {
            return Err(OpenSetError::Config(
                "fixmatch.unlabeled_ratio must be greater than 0".to_string(),
            ));
        }
        if !(self.margin.beta > 0.0 && self.margin.beta < 1.0) {
            return Err(OpenSetError::Config(
                "margin.beta must be in (0, 1)".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fixmatch.threshold, 0.95);
        assert_eq!(config.fixmatch.ema_decay, 0.999);
        assert_eq!(config.margin.beta, 0.9999);
        assert_eq!(config.margin.scale, 30.0);
        assert_eq!(config.margin.max_margin, 0.3);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = PipelineConfig::default();
        config.open_set.threshold = 1.5;
        assert!(matches!(config.validate(), Err(OpenSetError::Config(_))));
    }

    #[test]
    fn test_model_config_validation() {
        let mut config = ModelConfig::default();
        config.num_classes = 0;
        assert!(config.validate().is_err());

        config = ModelConfig::default();
        config.input_shape = [3, 0, 4];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_strategy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");

        let config = PipelineConfig {
            stage2_strategy: Stage2Strategy::FixMatch,
            rounds: 2,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.stage2_strategy, Stage2Strategy::FixMatch);
        assert_eq!(loaded.rounds, 2);
    }
}
