//! # Open-Set Semi-Supervised Learning
//!
//! Two-stage training of a classifier that must reject examples from classes it
//! never saw, built on the Burn framework.
//!
//! ## Features
//!
//! - **Confidence gate**: softmax argmax, or -1 ("unknown") below a threshold
//! - **Centroid calibration**: per-class feature centroids rescale the logits by
//!   reachability before gating
//! - **FixMatch** consistency training on weak/strong views with an **EMA teacher**
//! - **Self-training** on confident pseudo-labels with a class-balanced **margin loss**
//! - A **pipeline** state machine chaining the stages for any number of rounds
//!
//! ## Modules
//!
//! - `dataset`: In-memory datasets, batchers, augmentation and a season-shift generator
//! - `model`: The `OpenSetNet` trait, MLP and CNN backbones, configuration
//! - `inference`: Gate, centroid table and the open-set predictor
//! - `training`: Stage trainers, losses, EMA teacher, schedules and the pipeline
//! - `utils`: Errors, logging, metrics and artifact files
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use openset_ssl::backend::{default_device, TrainingBackend};
//! use openset_ssl::dataset::{SeasonShiftConfig, SeasonShiftData};
//! use openset_ssl::model::{MlpNetConfig, PipelineConfig};
//! use openset_ssl::training::{LoaderFactory, Pipeline};
//!
//! let data = SeasonShiftData::generate(&SeasonShiftConfig::default())?;
//! let model = MlpNetConfig::new(8, 3).init::<TrainingBackend>(&default_device());
//! let pipeline = Pipeline::new(PipelineConfig::default(), LoaderFactory::new(default_device()), "output/run")?;
//! let snapshot = pipeline.run(model, &data.into())?;
//! ```

pub mod backend;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use dataset::{InMemoryDataset, SampleItem, SeasonShiftConfig, SeasonShiftData};
pub use inference::{CentroidTable, ConfidenceGate, OpenSetPredictor, PredictionSet};
pub use model::config::{
    FixMatchConfig, MarginLossConfig, OpenSetConfig, PseudoLabelStrategy, Stage2Strategy, TrainingConfig,
};
pub use model::{BestWeights, CnnNet, MlpNet, ModelConfig, OpenSetNet, PipelineConfig};
pub use training::{
    EmaTeacher, FixMatchTrainer, LoaderFactory, MemoryDeployer, Pipeline, PipelineData, PseudoLabelSet,
    SelfTrainer, Stage, Stage1Trainer, StageSnapshot, TrainingState,
};
pub use utils::error::{OpenSetError, Result};
pub use utils::metrics::OpenSetReport;

/// Label of an example the gate rejected, or of a ground-truth out-of-distribution example
pub const UNKNOWN_CLASS: i64 = -1;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
