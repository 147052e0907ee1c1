//! Self-training Stage 2 on gated pseudo-labels
//!
//! The training set is the labeled source data plus every target example the
//! gate accepted, carrying its pseudo-label. Class counts of that set drive
//! the margin loss, which is rebuilt at the start of every epoch. After the
//! last epoch the best weights are restored and the pseudo-labels are
//! regenerated from them to seed the next round.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use tracing::info;

use super::loss::Criterion;
use super::pseudo_label::{PseudoLabelSet, PseudoLabeler};
use super::scheduler::LrScheduler;
use super::{build_optimizer, closed_set_accuracy, train_supervised_epoch, LoaderFactory, SgdOptimizer, TrainingState};
use crate::dataset::{InMemoryDataset, LabeledLoader};
use crate::inference::reachability::CentroidTable;
use crate::model::config::{MarginLossConfig, TrainingConfig};
use crate::model::{save_weights, BestWeights, OpenSetNet};
use crate::utils::error::{OpenSetError, Result};
use crate::utils::logging::StageLogger;

/// Pseudo-label + margin-loss trainer
pub struct SelfTrainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + OpenSetNet<B>,
{
    model: M,
    optimizer: SgdOptimizer<B, M>,
    scheduler: LrScheduler,
    config: TrainingConfig,
    margin: Option<MarginLossConfig>,
    labeler: PseudoLabeler,
    train_set: Option<InMemoryDataset>,
    best: BestWeights<M>,
    /// Current training state
    pub state: TrainingState,
}

impl<B, M> SelfTrainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + OpenSetNet<B>,
    M::InnerModule: OpenSetNet<B::InnerBackend>,
{
    /// `margin: None` trains with plain cross entropy
    pub fn new(model: M, config: TrainingConfig, margin: Option<MarginLossConfig>, labeler: PseudoLabeler) -> Self {
        Self {
            optimizer: build_optimizer::<B, M>(&config, true),
            scheduler: LrScheduler::new(config.lr_schedule.clone(), config.learning_rate),
            state: TrainingState::new(config.learning_rate),
            best: BestWeights::new(),
            train_set: None,
            model,
            config,
            margin,
            labeler,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn best(&self) -> &BestWeights<M> {
        &self.best
    }

    pub fn pseudo_labels(&self) -> Option<&PseudoLabelSet> {
        self.labeler.current()
    }

    pub fn train_set(&self) -> Option<&InMemoryDataset> {
        self.train_set.as_ref()
    }

    /// Regenerate the pseudo-labels from the current model and rebuild the training set
    pub fn set_train(
        &mut self,
        labeled: &InMemoryDataset,
        target: &InMemoryDataset,
        loaders: &LoaderFactory<B>,
        centroids: Option<&CentroidTable>,
    ) -> Result<()> {
        let mut target_loader = loaders.eval_loader(target, self.config.batch_size);
        self.labeler.reset(
            &self.model.valid(),
            &mut target_loader,
            centroids,
            loaders.inner_device(),
        )?;
        self.rebuild_train_set(labeled, target)
    }

    /// Train on an existing pseudo-label set instead of regenerating one
    pub fn use_pseudo_labels(
        &mut self,
        set: PseudoLabelSet,
        labeled: &InMemoryDataset,
        target: &InMemoryDataset,
    ) -> Result<()> {
        self.labeler.replace(set);
        self.rebuild_train_set(labeled, target)
    }

    fn rebuild_train_set(&mut self, labeled: &InMemoryDataset, target: &InMemoryDataset) -> Result<()> {
        let set = self
            .labeler
            .current()
            .ok_or_else(|| OpenSetError::Config("no pseudo-label set to train on".to_string()))?;
        let accepted = set.apply_to(target)?;
        info!(
            "Stage-2 training set: {} labeled + {} pseudo-labeled",
            labeled.items().len(),
            accepted.items().len()
        );
        self.train_set = Some(labeled.known_only().concat(&accepted)?);
        Ok(())
    }

    /// Criterion for the current training set's class counts
    fn criterion(&self, counts: &[usize]) -> Criterion {
        match &self.margin {
            Some(config) => Criterion::margin(counts, config),
            None => Criterion::CrossEntropy,
        }
    }

    /// Train on the current set, then restore the best weights and regenerate
    /// the pseudo-labels from them
    pub fn train(
        &mut self,
        labeled: &InMemoryDataset,
        target: &InMemoryDataset,
        val_loader: &mut LabeledLoader<B::InnerBackend>,
        loaders: &LoaderFactory<B>,
        centroids: Option<&CentroidTable>,
        weights_path: &Path,
    ) -> Result<()> {
        let train_set = match self.train_set.clone() {
            Some(set) => set,
            None => {
                self.set_train(labeled, target, loaders, centroids)?;
                self.train_set.clone().ok_or_else(|| {
                    OpenSetError::Config("pseudo-label reset produced no training set".to_string())
                })?
            }
        };

        let num_classes = self.model.num_classes();
        let mut loader = loaders.train_loader(&train_set, self.config.batch_size, self.config.seed);
        let mut logger = StageLogger::new("self-training", self.config.epochs);

        for epoch in 0..self.config.epochs {
            self.state.epoch = epoch;
            logger.start_epoch(epoch);

            let counts = train_set.class_counts(num_classes);
            let criterion = self.criterion(&counts);
            if let Criterion::Margin(loss) = &criterion {
                info!("Class counts {:?} -> weights {:?}", counts, loss.weights());
            }

            let (model, stats) = train_supervised_epoch(
                self.model.clone(),
                &mut self.optimizer,
                &mut loader,
                &criterion,
                &mut self.state,
                self.config.log_interval,
            );
            self.model = model;
            let lr = self.state.current_lr;
            self.state.current_lr = self.scheduler.step();

            let score = closed_set_accuracy(&self.model.valid(), val_loader)?;
            self.state.record_val_score(score);
            self.best.update_best(&self.model, score, epoch);

            logger.end_epoch(stats.loss, score, lr);
        }

        logger.finish(self.best.score(), self.best.epoch());
        save_weights(self.best.best().unwrap_or(&self.model), weights_path)?;

        self.model = self.best.revert(self.model.clone());
        self.set_train(labeled, target, loaders, centroids)
    }

    /// Hand over the model, the best snapshot and the latest pseudo-labels
    pub fn into_parts(mut self) -> (M, BestWeights<M>, Option<PseudoLabelSet>) {
        let labels = self.labeler.take();
        (self.model, self.best, labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{AugmentationConfig, SampleItem};
    use crate::model::config::{OpenSetConfig, PseudoLabelStrategy};
    use crate::model::{MlpNet, MlpNetConfig};
    use crate::training::scheduler::LrSchedule;
    use crate::UNKNOWN_CLASS;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    fn dataset(points: &[([f32; 2], i64)]) -> InMemoryDataset {
        let items = points
            .iter()
            .map(|(x, l)| SampleItem::new(x.to_vec(), *l))
            .collect();
        InMemoryDataset::new(items, [2, 1, 1]).unwrap()
    }

    fn setup() -> (InMemoryDataset, InMemoryDataset, LoaderFactory<TestBackend>, TrainingConfig) {
        let labeled = dataset(&[([3.0, 0.0], 0), ([0.0, 3.0], 1)]);
        let target = dataset(&[([2.9, 0.2], 0), ([0.1, 3.1], 1), ([3.2, 0.1], 0), ([1.0, 1.0], UNKNOWN_CLASS)]);
        let factory = LoaderFactory::<TestBackend>::new(Default::default())
            .with_augmentation(AugmentationConfig::none(), AugmentationConfig::none());
        let config = TrainingConfig {
            epochs: 3,
            batch_size: 4,
            learning_rate: 0.05,
            lr_schedule: LrSchedule::Constant,
            ..Default::default()
        };
        (labeled, target, factory, config)
    }

    #[test]
    fn test_training_set_is_labeled_plus_accepted() {
        let (labeled, target, factory, config) = setup();
        let model: MlpNet<TestBackend> = MlpNetConfig::new(2, 2).init(factory.device());
        let labeler = PseudoLabeler::new(PseudoLabelStrategy::Confidence, &OpenSetConfig::default());
        let mut trainer = SelfTrainer::new(model, config, Some(MarginLossConfig::default()), labeler);

        let set = PseudoLabelSet::from_predictions(
            &crate::inference::PredictionSet {
                num_classes: 2,
                predictions: vec![0, 1, -1, -1],
                raw_predictions: vec![0, 1, 0, 0],
                confidences: vec![0.9, 0.9, 0.3, 0.2],
                labels: target.labels(),
                logits: vec![0.0; 8],
            },
            false,
        );
        trainer.use_pseudo_labels(set, &labeled, &target).unwrap();

        let train = trainer.train_set().unwrap();
        assert_eq!(train.labels(), vec![0, 1, 0, 1]);
        assert_eq!(train.class_counts(2), vec![2, 2]);
    }

    #[test]
    fn test_train_reverts_and_regenerates_labels() {
        let dir = tempfile::TempDir::new().unwrap();
        let weights = dir.path().join("model");
        let (labeled, target, factory, config) = setup();

        let model: MlpNet<TestBackend> = MlpNetConfig::new(2, 2).init(factory.device());
        let labeler = PseudoLabeler::new(
            PseudoLabelStrategy::Confidence,
            &OpenSetConfig {
                threshold: 0.0,
                ..Default::default()
            },
        );
        let mut trainer = SelfTrainer::new(model, config, Some(MarginLossConfig::default()), labeler);
        let mut val = factory.eval_loader(&labeled, 2);

        trainer
            .train(&labeled, &target, &mut val, &factory, None, &weights)
            .unwrap();

        assert_eq!(trainer.state.val_scores.len(), 3);
        assert!(dir.path().join("model.mpk").exists());
        let labels = trainer.pseudo_labels().unwrap();
        assert_eq!(labels.len(), 4);
        assert_eq!(labels.num_accepted(), 4);

        let (_, best, labels) = trainer.into_parts();
        assert!(best.best().is_some());
        assert!(labels.is_some());
    }
}
