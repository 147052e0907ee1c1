//! Centroid calibration of a trained Stage-1 model ("memory deploy")
//!
//! Loads the persisted centroid table (or computes and persists it from the
//! labeled loader), runs the reachability-calibrated, gated model over the
//! target data and writes the confident predictions and the initial
//! pseudo-labels next to the weights.

use std::path::Path;

use burn::prelude::*;
use tracing::info;

use super::pseudo_label::PseudoLabelSet;
use crate::dataset::LabeledLoader;
use crate::inference::reachability::CentroidTable;
use crate::inference::{ConfidenceGate, OpenSetPredictor, PredictionSet};
use crate::model::config::OpenSetConfig;
use crate::model::OpenSetNet;
use crate::utils::artifacts::{self, sibling_path};
use crate::utils::error::Result;
use crate::utils::metrics::OpenSetReport;

/// Everything a calibration pass produces
#[derive(Debug, Clone)]
pub struct DeployOutput {
    pub centroids: CentroidTable,
    pub predictions: PredictionSet,
    pub report: OpenSetReport,
    pub pseudo_labels: PseudoLabelSet,
}

/// Runs the calibration pass with the open-set settings of a run
#[derive(Debug, Clone)]
pub struct MemoryDeployer {
    config: OpenSetConfig,
}

impl MemoryDeployer {
    pub fn new(config: OpenSetConfig) -> Self {
        Self { config }
    }

    /// Calibrate `model` and label the target data.
    ///
    /// Writes `_centroids.bin` (when computed), `_conf_preds.bin`, and either
    /// `_init_pseudo_hard.bin` + `_init_pseudo_soft.bin` or `_init_pseudo.bin`.
    pub fn deploy<B: Backend, M: OpenSetNet<B>>(
        &self,
        model: &M,
        weights_path: &Path,
        labeled: &mut LabeledLoader<B>,
        target: &mut LabeledLoader<B>,
        train_counts: &[usize],
        device: &B::Device,
    ) -> Result<DeployOutput> {
        let centroids =
            CentroidTable::load_or_compute(&sibling_path(weights_path, "_centroids.bin"), model, labeled)?;

        let predictor = OpenSetPredictor::<B>::new(ConfidenceGate::new(self.config.threshold as f32))
            .with_reachability(&centroids, self.config.reachability_scale as f32, device);
        let predictions = predictor.collect(model, target)?;

        let report = predictions.report(&predictions.evaluated_classes(), train_counts)?;
        info!("Calibrated target evaluation:\n{}", report);

        artifacts::write_i64(&sibling_path(weights_path, "_conf_preds.bin"), &report.conf_preds)?;

        let pseudo_labels = PseudoLabelSet::from_predictions(&predictions, self.config.soft_pseudo_labels);
        pseudo_labels.save(weights_path)?;
        info!("{}", pseudo_labels.stats());

        Ok(DeployOutput {
            centroids,
            predictions,
            report,
            pseudo_labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{BatchLoader, InMemoryDataset, LabeledBatcher, SampleItem};
    use crate::model::{MlpNet, MlpNetConfig};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn loader(items: Vec<SampleItem>) -> LabeledLoader<TestBackend> {
        let dataset = InMemoryDataset::new(items, [2, 1, 1]).unwrap();
        BatchLoader::new(dataset, LabeledBatcher::<TestBackend>::new(Default::default(), [2, 1, 1]), 4)
    }

    fn model() -> MlpNet<TestBackend> {
        MlpNetConfig::new(2, 2)
            .with_feature_dim(4)
            .init(&Default::default())
    }

    fn split() -> (LabeledLoader<TestBackend>, LabeledLoader<TestBackend>) {
        let labeled = loader(vec![
            SampleItem::new(vec![1.0, 0.0], 0),
            SampleItem::new(vec![0.0, 1.0], 1),
        ]);
        let target = loader(vec![
            SampleItem::new(vec![0.9, 0.1], 0),
            SampleItem::new(vec![0.1, 0.9], 1),
            SampleItem::new(vec![40.0, 40.0], -1),
        ]);
        (labeled, target)
    }

    #[test]
    fn test_hard_pseudo_label_artifacts() {
        let dir = tempfile::TempDir::new().unwrap();
        let weights = dir.path().join("model");
        let (mut labeled, mut target) = split();

        let deployer = MemoryDeployer::new(OpenSetConfig::default());
        let out = deployer
            .deploy(&model(), &weights, &mut labeled, &mut target, &[1, 1], &Default::default())
            .unwrap();

        assert_eq!(out.predictions.len(), 3);
        assert_eq!(out.centroids.num_classes(), 2);
        assert!(dir.path().join("model_centroids.bin").exists());
        assert_eq!(
            artifacts::read_i64(&dir.path().join("model_conf_preds.bin")).unwrap(),
            out.report.conf_preds
        );
        assert_eq!(
            artifacts::read_i64(&dir.path().join("model_init_pseudo.bin")).unwrap(),
            out.pseudo_labels.hard()
        );
        assert!(!dir.path().join("model_init_pseudo_soft.bin").exists());
    }

    #[test]
    fn test_soft_mode_and_centroid_reuse() {
        let dir = tempfile::TempDir::new().unwrap();
        let weights = dir.path().join("model");
        let stored = CentroidTable::from_rows(2, 4, vec![0.5; 8]).unwrap();
        stored.save(&sibling_path(&weights, "_centroids.bin")).unwrap();
        let (mut labeled, mut target) = split();

        let deployer = MemoryDeployer::new(OpenSetConfig {
            soft_pseudo_labels: true,
            ..Default::default()
        });
        let out = deployer
            .deploy(&model(), &weights, &mut labeled, &mut target, &[1, 1], &Default::default())
            .unwrap();

        assert_eq!(out.centroids, stored);
        let soft = artifacts::read_f32(&dir.path().join("model_init_pseudo_soft.bin"), 6).unwrap();
        assert_eq!(Some(soft.as_slice()), out.pseudo_labels.soft());
        assert!(dir.path().join("model_init_pseudo_hard.bin").exists());
    }
}
