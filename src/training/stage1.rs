//! Stage-1 supervised training
//!
//! Cross-entropy training on labeled source data with SGD and a per-epoch
//! schedule. Each epoch is validated with the macro-F1 of gated predictions;
//! the best snapshot is kept in memory and written once after the last epoch.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use tracing::info;

use super::loss::Criterion;
use super::scheduler::LrScheduler;
use super::{build_optimizer, train_supervised_epoch, EpochStats, SgdOptimizer, TrainingState};
use crate::dataset::LabeledLoader;
use crate::inference::{ConfidenceGate, OpenSetPredictor, PredictionSet};
use crate::model::config::{OpenSetConfig, TrainingConfig};
use crate::model::{save_weights, BestWeights, OpenSetNet};
use crate::utils::artifacts::{self, sibling_path};
use crate::utils::error::Result;
use crate::utils::logging::StageLogger;
use crate::utils::metrics::OpenSetReport;

/// Stage-1 trainer for an [`OpenSetNet`]
pub struct Stage1Trainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + OpenSetNet<B>,
{
    model: M,
    optimizer: SgdOptimizer<B, M>,
    scheduler: LrScheduler,
    criterion: Criterion,
    config: TrainingConfig,
    gate: ConfidenceGate,
    best: BestWeights<M>,
    /// Current training state
    pub state: TrainingState,
}

impl<B, M> Stage1Trainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + OpenSetNet<B>,
    M::InnerModule: OpenSetNet<B::InnerBackend>,
{
    pub fn new(model: M, config: TrainingConfig, open_set: &OpenSetConfig) -> Self {
        info!(
            "Stage 1: {} epochs, batch size {}, lr {}, schedule {:?}",
            config.epochs, config.batch_size, config.learning_rate, config.lr_schedule
        );
        Self {
            model,
            optimizer: build_optimizer::<B, M>(&config, true),
            scheduler: LrScheduler::new(config.lr_schedule.clone(), config.learning_rate),
            criterion: Criterion::CrossEntropy,
            gate: ConfidenceGate::new(open_set.threshold as f32),
            state: TrainingState::new(config.learning_rate),
            best: BestWeights::new(),
            config,
        }
    }

    /// The model as trained so far (last epoch, not the best snapshot)
    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn best(&self) -> &BestWeights<M> {
        &self.best
    }

    /// One pass over the labeled loader
    pub fn train_epoch(&mut self, loader: &mut LabeledLoader<B>) -> EpochStats {
        let (model, stats) = train_supervised_epoch(
            self.model.clone(),
            &mut self.optimizer,
            loader,
            &self.criterion,
            &mut self.state,
            self.config.log_interval,
        );
        self.model = model;
        stats
    }

    /// Gated evaluation of the current model, logged as a per-class report
    pub fn evaluate(
        &self,
        loader: &mut LabeledLoader<B::InnerBackend>,
        train_counts: &[usize],
    ) -> Result<(PredictionSet, OpenSetReport)> {
        let predictor = OpenSetPredictor::new(self.gate);
        let predictions = predictor.collect(&self.model.valid(), loader)?;
        let report = predictions.report(&predictions.evaluated_classes(), train_counts)?;
        info!("\n{}", report);
        Ok((predictions, report))
    }

    /// Gated evaluation on the test split; persists `<stem>_conf_preds.bin`
    pub fn evaluate_test(
        &self,
        loader: &mut LabeledLoader<B::InnerBackend>,
        train_counts: &[usize],
        weights_path: &Path,
    ) -> Result<OpenSetReport> {
        let (_, report) = self.evaluate(loader, train_counts)?;
        artifacts::write_i64(&sibling_path(weights_path, "_conf_preds.bin"), &report.conf_preds)?;
        Ok(report)
    }

    /// One epoch: train, step the schedule, validate and keep the best.
    /// Returns the epoch statistics and the validation macro-F1.
    pub fn run_epoch(
        &mut self,
        epoch: usize,
        train_loader: &mut LabeledLoader<B>,
        val_loader: &mut LabeledLoader<B::InnerBackend>,
        train_counts: &[usize],
    ) -> Result<(EpochStats, f64)> {
        self.state.epoch = epoch;
        let stats = self.train_epoch(train_loader);
        self.state.current_lr = self.scheduler.step();

        let (_, report) = self.evaluate(val_loader, train_counts)?;
        self.state.record_val_score(report.macro_f1);
        self.best.update_best(&self.model, report.macro_f1, epoch);
        Ok((stats, report.macro_f1))
    }

    /// Run every configured epoch
    pub fn train(
        &mut self,
        train_loader: &mut LabeledLoader<B>,
        val_loader: &mut LabeledLoader<B::InnerBackend>,
        train_counts: &[usize],
    ) -> Result<()> {
        let mut logger = StageLogger::new("stage1", self.config.epochs);

        for epoch in 0..self.config.epochs {
            logger.start_epoch(epoch);
            let lr = self.state.current_lr;
            let (stats, score) = self.run_epoch(epoch, train_loader, val_loader, train_counts)?;
            logger.end_epoch(stats.loss, score, lr);
        }

        logger.finish(self.best.score(), self.best.epoch());
        Ok(())
    }

    /// Continue from the best snapshot instead of the last epoch
    pub fn restore_best(&mut self) {
        self.model = self.best.revert(self.model.clone());
    }

    /// Write the best snapshot (or the current model if none was taken)
    pub fn save_best(&self, weights_path: &Path) -> Result<()> {
        save_weights(self.best.best().unwrap_or(&self.model), weights_path)
    }

    /// Hand over the last-epoch model and the best snapshot
    pub fn into_parts(self) -> (M, BestWeights<M>) {
        (self.model, self.best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{AugmentationConfig, SeasonShiftConfig, SeasonShiftData};
    use crate::inference::reachability::CentroidTable;
    use crate::model::{MlpNet, MlpNetConfig};
    use crate::training::LoaderFactory;
    use crate::training::scheduler::LrSchedule;
    use crate::utils::host_f32;
    use crate::UNKNOWN_CLASS;
    use burn::backend::Autodiff;
    use burn::prelude::*;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    fn separable() -> SeasonShiftData {
        SeasonShiftData::generate(&SeasonShiftConfig {
            num_classes: 3,
            feature_dim: 5,
            separation: 3.0,
            noise: 0.3,
            season_shift: 0.0,
            labeled_per_class: 2,
            unlabeled_per_class: 0,
            test_per_class: 10,
            ood_count: 0,
            ood_distance: 0.0,
            seed: 3,
        })
        .unwrap()
    }

    fn trained(data: &SeasonShiftData, factory: &LoaderFactory<TestBackend>) -> Stage1Trainer<TestBackend, MlpNet<TestBackend>> {
        let config = TrainingConfig {
            epochs: 100,
            batch_size: 6,
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
            lr_schedule: LrSchedule::Constant,
            log_interval: 1,
            seed: 1,
        };
        let model = MlpNetConfig::new(5, 3)
            .with_feature_dim(16)
            .init::<TestBackend>(factory.device());
        let mut trainer = Stage1Trainer::new(model, config, &OpenSetConfig::default());

        let counts = data.labeled.class_counts(3);
        let mut train = factory.train_loader(&data.labeled, 6, 1);
        let mut val = factory.eval_loader(&data.validation, 16);
        trainer.train(&mut train, &mut val, &counts).unwrap();
        trainer
    }

    #[test]
    fn test_two_labeled_per_class_reaches_full_confident_accuracy() {
        let data = separable();
        let factory = LoaderFactory::<TestBackend>::new(Default::default())
            .with_augmentation(AugmentationConfig::none(), AugmentationConfig::none());
        let trainer = trained(&data, &factory);

        let counts = data.labeled.class_counts(3);
        let mut held_out = factory.eval_loader(&data.validation, 16);
        let (_, report) = trainer.evaluate(&mut held_out, &counts).unwrap();

        assert_eq!(report.avg_conf_acc, 1.0);
        assert_eq!(report.fp_pct, 0.0);
        assert_eq!(report.unknown_pct, 0.0);
        assert!(trainer.best().best().is_some());
        assert_eq!(trainer.state.val_scores.len(), 100);
    }

    #[test]
    fn test_far_vector_is_unknown_after_calibration() {
        let data = separable();
        let factory = LoaderFactory::<TestBackend>::new(Default::default())
            .with_augmentation(AugmentationConfig::none(), AugmentationConfig::none());
        let trainer = trained(&data, &factory);
        let model = trainer.model().valid();
        let device = factory.inner_device();

        let mut labeled = factory.eval_loader(&data.labeled, 6);
        let table = CentroidTable::compute(&model, &mut labeled).unwrap();

        // Scale at the tightest in-distribution distance
        let mut held_out = factory.eval_loader(&data.validation, 64);
        let batch = held_out.iter().next().unwrap();
        let features = host_f32(model.feature(batch.images), "features").unwrap();
        let scale = table
            .min_distances(&features)
            .into_iter()
            .fold(f32::INFINITY, f32::min);

        let mut far = vec![0.0f32; 5];
        far[4] = 1000.0;
        let input = Tensor::<NdArray, 4>::from_floats(TensorData::new(far, [1, 5, 1, 1]), device);

        let predictor = OpenSetPredictor::<NdArray>::new(ConfidenceGate::new(0.5))
            .with_reachability(&table, scale, device);
        let calibrated = predictor.gate().apply(predictor.logits(&model, input));
        let prediction = host_f32(calibrated.predictions.float(), "prediction").unwrap();
        assert_eq!(prediction[0] as i64, UNKNOWN_CLASS);
    }

    #[test]
    fn test_test_split_writes_conf_preds() {
        let dir = tempfile::TempDir::new().unwrap();
        let weights = dir.path().join("model");
        let data = separable();
        let factory = LoaderFactory::<TestBackend>::new(Default::default());
        let model = MlpNetConfig::new(5, 3).init::<TestBackend>(factory.device());
        let trainer = Stage1Trainer::new(model, TrainingConfig::default(), &OpenSetConfig::default());

        let mut test = factory.eval_loader(&data.validation, 8);
        let report = trainer.evaluate_test(&mut test, &[2, 2, 2], &weights).unwrap();

        let saved = artifacts::read_i64(&dir.path().join("model_conf_preds.bin")).unwrap();
        assert_eq!(saved, report.conf_preds);
        assert_eq!(saved.len(), 30);

        trainer.save_best(&weights).unwrap();
        assert!(dir.path().join("model.mpk").exists());
    }
}
