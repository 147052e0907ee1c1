//! Inference module: open-set prediction
//!
//! This module provides:
//! - The confidence gate that turns low-confidence predictions into -1
//! - Centroid tables and reachability rescaling of logits
//! - A predictor that collects gated predictions over a whole loader

pub mod gate;
pub mod predictor;
pub mod reachability;

pub use gate::{ConfidenceGate, GateOutput, GatedPrediction};
pub use predictor::{OpenSetPredictor, PredictionRecord, PredictionSet};
pub use reachability::{min_centroid_distance, rescale, CentroidTable};
