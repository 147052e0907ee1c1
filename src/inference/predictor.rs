//! Open-set predictor
//!
//! Runs a frozen model over a loader, optionally applies reachability
//! rescaling, gates the result and gathers everything host-side for reports,
//! pseudo-labels and artifact dumps.

use burn::prelude::*;

use super::gate::ConfidenceGate;
use super::reachability::{rescale, CentroidTable};
use crate::dataset::{BatchLoader, LabeledBatch, SampleItem};
use crate::model::OpenSetNet;
use crate::utils::error::Result;
use crate::utils::{host_f32, host_i64};
use crate::utils::metrics::OpenSetReport;
use crate::UNKNOWN_CLASS;

/// One example's gated prediction alongside its true label
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionRecord {
    /// Class id or -1
    pub predicted: i64,
    /// In [0, 1]
    pub confidence: f32,
    pub label: i64,
}

/// Host-side outputs of one full pass
#[derive(Debug, Clone, Default)]
pub struct PredictionSet {
    pub num_classes: usize,
    pub predictions: Vec<i64>,
    pub raw_predictions: Vec<i64>,
    pub confidences: Vec<f32>,
    pub labels: Vec<i64>,
    /// Row-major `[N, num_classes]` logits after calibration
    pub logits: Vec<f32>,
}

impl PredictionSet {
    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = PredictionRecord> + '_ {
        self.predictions
            .iter()
            .zip(&self.confidences)
            .zip(&self.labels)
            .map(|((&predicted, &confidence), &label)| PredictionRecord {
                predicted,
                confidence,
                label,
            })
    }

    /// Known classes present among the labels, sorted
    pub fn evaluated_classes(&self) -> Vec<i64> {
        let mut classes: Vec<i64> = self
            .labels
            .iter()
            .copied()
            .filter(|&l| l >= 0 && (l as usize) < self.num_classes)
            .collect();
        classes.sort_unstable();
        classes.dedup();
        classes
    }

    pub fn confident_mask(&self) -> Vec<bool> {
        self.predictions.iter().map(|&p| p != UNKNOWN_CLASS).collect()
    }

    /// Gated report against the stored labels
    pub fn report(&self, known_classes: &[i64], train_counts: &[usize]) -> Result<OpenSetReport> {
        OpenSetReport::evaluate(
            &self.predictions,
            &self.labels,
            Some(&self.raw_predictions),
            known_classes,
            train_counts,
        )
    }
}

/// Gate plus optional reachability calibration
#[derive(Debug, Clone)]
pub struct OpenSetPredictor<B: Backend> {
    gate: ConfidenceGate,
    centroids: Option<(Tensor<B, 2>, f32)>,
}

impl<B: Backend> OpenSetPredictor<B> {
    pub fn new(gate: ConfidenceGate) -> Self {
        Self {
            gate,
            centroids: None,
        }
    }

    /// Rescale logits by `scale / d_min` before gating
    pub fn with_reachability(mut self, table: &CentroidTable, scale: f32, device: &B::Device) -> Self {
        self.centroids = Some((table.to_tensor(device), scale));
        self
    }

    pub fn gate(&self) -> ConfidenceGate {
        self.gate
    }

    /// Logits for a batch, rescaled when calibration is enabled
    pub fn logits<M: OpenSetNet<B>>(&self, model: &M, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = model.feature(images);
        let logits = model.classifier(features.clone());
        match &self.centroids {
            Some((centroids, scale)) => rescale(logits, features, centroids.clone(), *scale),
            None => logits,
        }
    }

    /// Run one pass over `loader` and gather predictions host-side
    pub fn collect<M: OpenSetNet<B>>(
        &self,
        model: &M,
        loader: &mut BatchLoader<SampleItem, LabeledBatch<B>>,
    ) -> Result<PredictionSet> {
        let mut set = PredictionSet {
            num_classes: model.num_classes(),
            ..Default::default()
        };

        for batch in loader.iter() {
            let logits = self.logits(model, batch.images);
            let out = self.gate.apply(logits.clone());

            set.logits.extend(host_f32(logits, "logits")?);
            set.predictions.extend(host_i64(out.predictions, "predictions")?);
            set.raw_predictions
                .extend(host_i64(out.raw_predictions, "raw predictions")?);
            set.confidences.extend(host_f32(out.confidences, "confidences")?);
            set.labels.extend(host_i64(batch.targets, "labels")?);
        }

        Ok(set)
    }
}
