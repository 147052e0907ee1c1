//! Pseudo-labels for the target data
//!
//! A frozen model is run over the target set, its logits are optionally
//! rescaled by centroid reachability, and the confidence gate decides which
//! examples receive a pseudo-label and which are rejected as unknown (-1).
//!
//! ## Lifecycle
//!
//! 1. Generate a set from a frozen snapshot (`PseudoLabeler::reset`)
//! 2. Build the Stage-2 training view: accepted examples, relabeled
//! 3. After Stage 2, regenerate from the new model; the new set replaces the old one

use std::path::Path;

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::{InMemoryDataset, LabeledLoader};
use crate::inference::reachability::CentroidTable;
use crate::inference::{ConfidenceGate, OpenSetPredictor, PredictionSet};
use crate::model::config::{OpenSetConfig, PseudoLabelStrategy};
use crate::model::OpenSetNet;
use crate::utils::artifacts::{self, sibling_path};
use crate::utils::error::{OpenSetError, Result};
use crate::UNKNOWN_CLASS;

/// Hard pseudo-labels for every target example, with optional soft logits
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoLabelSet {
    num_classes: usize,
    hard: Vec<i64>,
    /// Row-major `[N, num_classes]` calibrated logits
    soft: Option<Vec<f32>>,
    /// Held-out labels, kept for quality statistics only
    truth: Vec<i64>,
}

impl PseudoLabelSet {
    pub fn from_predictions(predictions: &PredictionSet, keep_soft: bool) -> Self {
        Self {
            num_classes: predictions.num_classes,
            hard: predictions.predictions.clone(),
            soft: keep_soft.then(|| predictions.logits.clone()),
            truth: predictions.labels.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.hard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hard.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn hard(&self) -> &[i64] {
        &self.hard
    }

    pub fn soft(&self) -> Option<&[f32]> {
        self.soft.as_deref()
    }

    /// Number of examples that received a pseudo-label
    pub fn num_accepted(&self) -> usize {
        self.hard.iter().filter(|&&l| l != UNKNOWN_CLASS).count()
    }

    /// Indices of examples that received a pseudo-label
    pub fn accepted_indices(&self) -> Vec<usize> {
        self.hard
            .iter()
            .enumerate()
            .filter(|(_, &l)| l != UNKNOWN_CLASS)
            .map(|(i, _)| i)
            .collect()
    }

    /// Per-class pseudo-label counts
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes];
        for &label in &self.hard {
            if let Some(count) = usize::try_from(label).ok().and_then(|c| counts.get_mut(c)) {
                *count += 1;
            }
        }
        counts
    }

    /// Accepted target examples carrying their pseudo-label
    pub fn apply_to(&self, target: &InMemoryDataset) -> Result<InMemoryDataset> {
        Ok(target.relabel(&self.hard)?.known_only())
    }

    /// Quality of the set against the held-out labels
    pub fn stats(&self) -> PseudoLabelStats {
        let mut stats = PseudoLabelStats {
            total_processed: self.hard.len(),
            ..Default::default()
        };
        for (&pseudo, &truth) in self.hard.iter().zip(&self.truth) {
            if pseudo == UNKNOWN_CLASS {
                stats.rejected_low_confidence += 1;
                continue;
            }
            stats.total_accepted += 1;
            if truth == UNKNOWN_CLASS {
                stats.accepted_unknown += 1;
            } else if truth == pseudo {
                stats.correct_predictions += 1;
            } else {
                stats.incorrect_predictions += 1;
            }
        }
        stats
    }

    /// Persist next to the weights: `_init_pseudo.bin`, or
    /// `_init_pseudo_hard.bin` plus `_init_pseudo_soft.bin` when soft logits are kept
    pub fn save(&self, weights_path: &Path) -> Result<()> {
        match &self.soft {
            Some(soft) => {
                artifacts::write_i64(&sibling_path(weights_path, "_init_pseudo_hard.bin"), &self.hard)?;
                artifacts::write_f32(&sibling_path(weights_path, "_init_pseudo_soft.bin"), soft)
            }
            None => artifacts::write_i64(&sibling_path(weights_path, "_init_pseudo.bin"), &self.hard),
        }
    }

    /// Read a set written by [`PseudoLabelSet::save`]; held-out labels are not persisted
    pub fn load(weights_path: &Path, num_classes: usize) -> Result<Self> {
        let hard_path = sibling_path(weights_path, "_init_pseudo_hard.bin");
        let (hard, soft) = if hard_path.exists() {
            let hard = artifacts::read_i64(&hard_path)?;
            let soft = artifacts::read_f32(
                &sibling_path(weights_path, "_init_pseudo_soft.bin"),
                hard.len() * num_classes,
            )?;
            (hard, Some(soft))
        } else {
            (artifacts::read_i64(&sibling_path(weights_path, "_init_pseudo.bin"))?, None)
        };
        Ok(Self {
            num_classes,
            truth: vec![UNKNOWN_CLASS; hard.len()],
            hard,
            soft,
        })
    }
}

/// Statistics about pseudo-labeling quality
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PseudoLabelStats {
    /// Total target examples processed
    pub total_processed: usize,

    /// Examples that received a pseudo-label
    pub total_accepted: usize,

    /// Rejected as unknown by the gate
    pub rejected_low_confidence: usize,

    /// Accepted although the held-out label is unknown
    pub accepted_unknown: usize,

    /// Correct predictions (matches held-out label)
    pub correct_predictions: usize,

    /// Incorrect predictions
    pub incorrect_predictions: usize,
}

impl PseudoLabelStats {
    /// Calculate acceptance rate
    pub fn acceptance_rate(&self) -> f64 {
        if self.total_processed == 0 {
            return 0.0;
        }
        self.total_accepted as f64 / self.total_processed as f64
    }

    /// Calculate accuracy of accepted pseudo-labels
    pub fn accuracy(&self) -> f64 {
        if self.total_accepted == 0 {
            return 0.0;
        }
        self.correct_predictions as f64 / self.total_accepted as f64
    }
}

impl std::fmt::Display for PseudoLabelStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Pseudo-Label Statistics:")?;
        writeln!(f, "  Total processed: {}", self.total_processed)?;
        writeln!(
            f,
            "  Accepted: {} ({:.1}%)",
            self.total_accepted,
            self.acceptance_rate() * 100.0
        )?;
        writeln!(f, "  Rejected as unknown: {}", self.rejected_low_confidence)?;
        writeln!(f, "  Accepted out-of-distribution: {}", self.accepted_unknown)?;
        write!(
            f,
            "  Accuracy: {:.1}% ({} correct, {} incorrect)",
            self.accuracy() * 100.0,
            self.correct_predictions,
            self.incorrect_predictions
        )
    }
}

/// Produces pseudo-label sets with the configured strategy
#[derive(Debug, Clone)]
pub struct PseudoLabeler {
    strategy: PseudoLabelStrategy,
    gate: ConfidenceGate,
    reachability_scale: f32,
    keep_soft: bool,
    current: Option<PseudoLabelSet>,
}

impl PseudoLabeler {
    pub fn new(strategy: PseudoLabelStrategy, open_set: &OpenSetConfig) -> Self {
        Self {
            strategy,
            gate: ConfidenceGate::new(open_set.threshold as f32),
            reachability_scale: open_set.reachability_scale as f32,
            keep_soft: open_set.soft_pseudo_labels,
            current: None,
        }
    }

    pub fn strategy(&self) -> PseudoLabelStrategy {
        self.strategy
    }

    /// The most recent set, if any
    pub fn current(&self) -> Option<&PseudoLabelSet> {
        self.current.as_ref()
    }

    /// Install an externally produced set, replacing the current one
    pub fn replace(&mut self, set: PseudoLabelSet) {
        self.current = Some(set);
    }

    pub fn take(&mut self) -> Option<PseudoLabelSet> {
        self.current.take()
    }

    /// Regenerate the set from a frozen model. The result replaces the previous set.
    pub fn reset<B: Backend, M: OpenSetNet<B>>(
        &mut self,
        model: &M,
        target: &mut LabeledLoader<B>,
        centroids: Option<&CentroidTable>,
        device: &B::Device,
    ) -> Result<&PseudoLabelSet> {
        let predictor = OpenSetPredictor::<B>::new(self.gate);
        let predictor = match (self.strategy, centroids) {
            (PseudoLabelStrategy::Confidence, _) => predictor,
            (PseudoLabelStrategy::Reachability, Some(table)) => {
                predictor.with_reachability(table, self.reachability_scale, device)
            }
            (PseudoLabelStrategy::Reachability, None) => {
                return Err(OpenSetError::Config(
                    "reachability pseudo-labels need a centroid table".to_string(),
                ))
            }
        };

        let predictions = predictor.collect(model, target)?;
        let set = PseudoLabelSet::from_predictions(&predictions, self.keep_soft);
        info!(
            "Reset pseudo-labels ({:?}): {} of {} accepted",
            self.strategy,
            set.num_accepted(),
            set.len()
        );
        info!("{}", set.stats());

        Ok(self.current.insert(set))
    }
}
