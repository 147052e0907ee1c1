//! Training module for two-stage open-set semi-supervised learning
//!
//! This module provides:
//! - Stage-1 supervised training and gated evaluation
//! - Centroid calibration and pseudo-label initialization ("memory deploy")
//! - FixMatch consistency training with an EMA teacher
//! - Self-training on confident pseudo-labels with the margin loss
//! - The pipeline state machine chaining the stages
//!
//! ## Pipeline
//!
//! 1. Train on labeled source data
//! 2. Compute class centroids and calibrate the model on the target data
//! 3. Keep confident target predictions as pseudo-labels, reject the rest as unknown
//! 4. Train Stage 2 on the labeled data plus the accepted target examples
//! 5. Optionally re-estimate the pseudo-labels and repeat

pub mod deploy;
pub mod ema;
pub mod fixmatch;
pub mod loss;
pub mod pipeline;
pub mod pseudo_label;
pub mod scheduler;
pub mod self_training;
pub mod stage1;

use burn::{
    module::AutodiffModule,
    optim::{
        adaptor::OptimizerAdaptor, decay::WeightDecayConfig, momentum::MomentumConfig,
        GradientsParams, Optimizer, Sgd, SgdConfig,
    },
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use tracing::{debug, info};

use crate::dataset::{
    AugmentationConfig, Augmenter, BatchLoader, CyclingLoader, InMemoryDataset, LabeledBatcher,
    LabeledLoader, PairBatcher, PairLoader,
};
use crate::model::config::TrainingConfig;
use crate::model::OpenSetNet;
use crate::utils::error::Result;
use crate::utils::metrics::{macro_accuracy, AccuracyTracker, RunningAverage};
use crate::utils::host_i64;

pub use deploy::{DeployOutput, MemoryDeployer};
pub use ema::EmaTeacher;
pub use fixmatch::{consistency_loss, ConsistencyOutput, FixMatchTrainer};
pub use loss::{Criterion, MarginLoss};
pub use pipeline::{Pipeline, PipelineData, Stage, StageSnapshot};
pub use pseudo_label::{PseudoLabelSet, PseudoLabelStats, PseudoLabeler};
pub use scheduler::{LrSchedule, LrScheduler};
pub use self_training::SelfTrainer;
pub use stage1::Stage1Trainer;

/// Training state for monitoring
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Current epoch (0-indexed)
    pub epoch: usize,
    /// Optimizer steps taken
    pub iteration: usize,
    /// Best validation score seen so far
    pub best_score: f64,
    /// Training loss history (per epoch)
    pub train_losses: Vec<f64>,
    /// Validation score history (per epoch)
    pub val_scores: Vec<f64>,
    /// Total training samples seen
    pub samples_seen: usize,
    /// Current learning rate
    pub current_lr: f64,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            iteration: 0,
            best_score: 0.0,
            train_losses: Vec::new(),
            val_scores: Vec::new(),
            samples_seen: 0,
            current_lr: 0.01,
        }
    }
}

impl TrainingState {
    /// Create a new training state with initial learning rate
    pub fn new(initial_lr: f64) -> Self {
        Self {
            current_lr: initial_lr,
            ..Default::default()
        }
    }

    /// Record training loss for current epoch
    pub fn record_train_loss(&mut self, loss: f64) {
        if self.train_losses.len() <= self.epoch {
            self.train_losses.push(loss);
        } else {
            self.train_losses[self.epoch] = loss;
        }
    }

    /// Record validation score for current epoch
    pub fn record_val_score(&mut self, score: f64) {
        if self.val_scores.len() <= self.epoch {
            self.val_scores.push(score);
        } else {
            self.val_scores[self.epoch] = score;
        }
        if score > self.best_score {
            self.best_score = score;
        }
    }
}

/// Summary of one pass over a training loader
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochStats {
    pub loss: f64,
    pub accuracy: f64,
    pub batches: usize,
}

/// SGD with momentum, as used by every stage
pub type SgdOptimizer<B, M> = OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, M, B>;

/// Build the SGD optimizer of a stage. `coupled_weight_decay` adds the L2 term
/// to the gradients; stages whose EMA teacher applies decoupled decay turn it off.
pub fn build_optimizer<B, M>(config: &TrainingConfig, coupled_weight_decay: bool) -> SgdOptimizer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let momentum = (config.momentum > 0.0).then(|| MomentumConfig::new().with_momentum(config.momentum));
    let weight_decay = (coupled_weight_decay && config.weight_decay > 0.0)
        .then(|| WeightDecayConfig::new((config.weight_decay as f32).into()));

    SgdConfig::new()
        .with_momentum(momentum)
        .with_weight_decay(weight_decay)
        .init()
}

/// Builds the loaders every stage needs from in-memory datasets.
///
/// Training loaders live on the autodiff backend and augment with the weak
/// policy; evaluation loaders live on the inner backend and never augment.
#[derive(Clone, Debug)]
pub struct LoaderFactory<B: AutodiffBackend> {
    device: B::Device,
    inner_device: <B::InnerBackend as Backend>::Device,
    weak: AugmentationConfig,
    strong: AugmentationConfig,
}

impl<B: AutodiffBackend> LoaderFactory<B> {
    pub fn new(device: B::Device) -> Self {
        let inner_device = Tensor::<B, 1>::zeros([1], &device).inner().device();
        Self {
            device,
            inner_device,
            weak: AugmentationConfig::weak(),
            strong: AugmentationConfig::strong(),
        }
    }

    /// Replace the weak (training) and strong augmentation policies
    pub fn with_augmentation(mut self, weak: AugmentationConfig, strong: AugmentationConfig) -> Self {
        self.weak = weak;
        self.strong = strong;
        self
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn inner_device(&self) -> &<B::InnerBackend as Backend>::Device {
        &self.inner_device
    }

    /// Shuffled, weakly augmented labeled batches
    pub fn train_loader(&self, dataset: &InMemoryDataset, batch_size: usize, seed: u64) -> LabeledLoader<B> {
        let shape = dataset.shape();
        let batcher = LabeledBatcher::<B>::new(self.device.clone(), shape)
            .with_augmentation(Augmenter::new(self.weak.clone(), shape), seed);
        BatchLoader::new(dataset.clone(), batcher, batch_size).shuffled(seed)
    }

    /// Sequential, unaugmented batches for evaluation and calibration
    pub fn eval_loader(&self, dataset: &InMemoryDataset, batch_size: usize) -> LabeledLoader<B::InnerBackend> {
        let batcher = LabeledBatcher::<B::InnerBackend>::new(self.inner_device.clone(), dataset.shape());
        BatchLoader::new(dataset.clone(), batcher, batch_size)
    }

    /// Never-ending weak/strong pairs, reshuffled on every restart
    pub fn pair_loader(&self, dataset: &InMemoryDataset, batch_size: usize, seed: u64) -> PairLoader<B> {
        let shape = dataset.shape();
        let batcher = PairBatcher::<B>::new(
            self.device.clone(),
            shape,
            Augmenter::new(self.weak.clone(), shape),
            Augmenter::new(self.strong.clone(), shape),
            seed,
        );
        CyclingLoader::new(BatchLoader::new(dataset.clone(), batcher, batch_size).shuffled(seed))
    }
}

/// Number of correct argmax predictions in a batch
pub(crate) fn batch_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let correct: i64 = logits
        .argmax(1)
        .squeeze::<1>(1)
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct.max(0) as usize
}

/// One supervised pass: forward, criterion, backward, optimizer step per batch.
///
/// Returns the updated model with the epoch's mean loss and accuracy.
pub fn train_supervised_epoch<B, M>(
    mut model: M,
    optimizer: &mut SgdOptimizer<B, M>,
    loader: &mut LabeledLoader<B>,
    criterion: &loss::Criterion,
    state: &mut TrainingState,
    log_interval: usize,
) -> (M, EpochStats)
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + OpenSetNet<B>,
{
    let num_batches = loader.num_batches();
    let mut losses = RunningAverage::new();
    let mut accuracy = AccuracyTracker::new();
    let log_interval = log_interval.max(1);

    for (batch_idx, batch) in loader.iter().enumerate() {
        let batch_size = batch.targets.dims()[0];
        let logits = model.forward(batch.images);
        let loss = criterion.forward(logits.clone(), batch.targets.clone());

        let loss_value: f64 = loss.clone().into_scalar().elem();
        losses.add(loss_value);
        accuracy.add(batch_correct(logits, batch.targets), batch_size);

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(state.current_lr, model, grads);

        state.iteration += 1;
        state.samples_seen += batch_size;

        if (batch_idx + 1) % log_interval == 0 || batch_idx + 1 == num_batches {
            debug!(
                "  Batch {}/{}: loss = {:.4}, acc = {:.2}%",
                batch_idx + 1,
                num_batches,
                loss_value,
                accuracy.accuracy() * 100.0
            );
        }
    }

    let stats = EpochStats {
        loss: losses.average(),
        accuracy: accuracy.accuracy(),
        batches: losses.count(),
    };
    state.record_train_loss(stats.loss);

    info!(
        "Epoch {} training ({}): loss = {:.4}, accuracy = {:.2}%",
        state.epoch + 1,
        criterion.name(),
        stats.loss,
        stats.accuracy * 100.0
    );
    (model, stats)
}

/// Closed-set macro accuracy of argmax predictions, with no gate applied
pub fn closed_set_accuracy<B: Backend, M: OpenSetNet<B>>(model: &M, loader: &mut LabeledLoader<B>) -> Result<f64> {
    let mut preds = Vec::with_capacity(loader.len());
    let mut labels = Vec::with_capacity(loader.len());

    for batch in loader.iter() {
        let logits = model.forward(batch.images);
        preds.extend(host_i64(logits.argmax(1).squeeze::<1>(1), "predictions")?);
        labels.extend(host_i64(batch.targets, "labels")?);
    }

    Ok(macro_accuracy(&preds, &labels, model.num_classes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SampleItem;
    use crate::model::{MlpNet, MlpNetConfig};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    fn toy() -> InMemoryDataset {
        let items = vec![
            SampleItem::new(vec![3.0, 0.0], 0),
            SampleItem::new(vec![2.8, 0.2], 0),
            SampleItem::new(vec![0.0, 3.0], 1),
            SampleItem::new(vec![0.1, 2.9], 1),
        ];
        InMemoryDataset::new(items, [2, 1, 1]).unwrap()
    }

    #[test]
    fn test_training_state_records_per_epoch() {
        let mut state = TrainingState::new(0.1);
        state.record_train_loss(1.0);
        state.record_train_loss(0.5);
        state.record_val_score(0.4);
        assert_eq!(state.train_losses, vec![0.5]);

        state.epoch = 1;
        state.record_val_score(0.3);
        assert_eq!(state.val_scores, vec![0.4, 0.3]);
        assert_eq!(state.best_score, 0.4);
        assert_eq!(state.current_lr, 0.1);
    }

    #[test]
    fn test_supervised_epochs_reduce_loss() {
        let device = Default::default();
        let factory = LoaderFactory::<TestBackend>::new(device)
            .with_augmentation(AugmentationConfig::none(), AugmentationConfig::none());
        let config = TrainingConfig {
            learning_rate: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        };

        let mut model: MlpNet<TestBackend> = MlpNetConfig::new(2, 2)
            .with_feature_dim(8)
            .init(factory.device());
        let mut optimizer = build_optimizer::<TestBackend, MlpNet<TestBackend>>(&config, true);
        let mut loader = factory.train_loader(&toy(), 4, 7);
        let mut state = TrainingState::new(config.learning_rate);

        let mut first = None;
        let mut last = EpochStats::default();
        for epoch in 0..30 {
            state.epoch = epoch;
            let (next, stats) = train_supervised_epoch(
                model,
                &mut optimizer,
                &mut loader,
                &loss::Criterion::CrossEntropy,
                &mut state,
                10,
            );
            model = next;
            first.get_or_insert(stats.loss);
            last = stats;
        }

        assert!(last.loss < first.unwrap());
        assert_eq!(state.iteration, 30);
        assert_eq!(state.samples_seen, 120);

        let mut eval = factory.eval_loader(&toy(), 2);
        assert_eq!(closed_set_accuracy(&model.valid(), &mut eval).unwrap(), 1.0);
    }

    #[test]
    fn test_pair_loader_cycles() {
        let factory = LoaderFactory::<TestBackend>::new(Default::default());
        let mut pairs = factory.pair_loader(&toy(), 3, 1);
        for _ in 0..5 {
            let batch = pairs.next().unwrap();
            assert_eq!(batch.weak.dims(), batch.strong.dims());
        }
        assert_eq!(pairs.restarts(), 2);
    }
}
