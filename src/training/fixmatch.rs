//! FixMatch Stage-2 training
//!
//! Every step draws one labeled batch and one unlabeled weak/strong batch,
//! runs the three groups through the network in a single forward pass and
//! combines the labeled cross entropy with a consistency term: the weak view's
//! confident argmax becomes the target for the strong view.
//!
//! With an EMA teacher enabled, validation and the saved checkpoint use the
//! teacher, and the teacher applies decoupled weight decay in place of the
//! optimizer's L2 term.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use tracing::{debug, info};

use super::ema::EmaTeacher;
use super::loss::{cross_entropy_per_sample, Criterion};
use super::scheduler::LrScheduler;
use super::{batch_correct, build_optimizer, closed_set_accuracy, EpochStats, SgdOptimizer, TrainingState};
use crate::dataset::{CyclingLoader, LabeledBatch, LabeledLoader, PairLoader, SampleItem, UnlabeledBatch};
use crate::inference::{ConfidenceGate, OpenSetPredictor};
use crate::model::config::{FixMatchConfig, OpenSetConfig, TrainingConfig};
use crate::model::{save_weights, BestWeights, OpenSetNet};
use crate::utils::artifacts::sibling_path;
use crate::utils::error::{OpenSetError, Result};
use crate::utils::logging::StageLogger;
use crate::utils::metrics::{AccuracyTracker, OpenSetReport, RunningAverage};
use crate::utils::{host_f32, host_i64};

/// Consistency term of one unlabeled batch
#[derive(Debug, Clone)]
pub struct ConsistencyOutput<B: Backend> {
    /// Mean over the full batch of the masked strong-view cross entropy, `[1]`
    pub loss: Tensor<B, 1>,
    /// Weak-view argmax `[N]`
    pub pseudo_labels: Tensor<B, 1, Int>,
    /// 1 where the weak-view confidence reaches the threshold `[N]`
    pub mask: Tensor<B, 1>,
}

/// `mean(CE(strong, argmax p_weak) * [max p_weak >= threshold])`, with the weak
/// logits detached
pub fn consistency_loss<B: Backend>(
    weak_logits: Tensor<B, 2>,
    strong_logits: Tensor<B, 2>,
    threshold: f64,
) -> ConsistencyOutput<B> {
    let [n, _] = weak_logits.dims();
    let probs = softmax(weak_logits.detach(), 1);
    let (max_probs, pseudo_labels) = probs.max_dim_with_indices(1);

    let mask = max_probs.greater_equal_elem(threshold).float().reshape([n]);
    let pseudo_labels = pseudo_labels.reshape([n]);
    let loss = (cross_entropy_per_sample(strong_logits, pseudo_labels.clone()) * mask.clone()).mean();

    ConsistencyOutput {
        loss,
        pseudo_labels,
        mask,
    }
}

/// Host-side numbers of one optimizer step
#[derive(Debug, Clone, Copy, Default)]
pub struct StepStats {
    pub loss: f64,
    pub loss_labeled: f64,
    pub loss_unlabeled: f64,
    pub mask_rate: f64,
    pub labeled_correct: usize,
    pub labeled_total: usize,
    /// Masked unlabeled examples whose held-out label matches the pseudo-label
    pub unlabeled_correct: usize,
    /// Masked unlabeled examples with a known held-out label
    pub unlabeled_total: usize,
}

/// FixMatch trainer with an optional EMA teacher
pub struct FixMatchTrainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + OpenSetNet<B>,
{
    model: M,
    optimizer: SgdOptimizer<B, M>,
    scheduler: LrScheduler,
    config: TrainingConfig,
    fixmatch: FixMatchConfig,
    gate: ConfidenceGate,
    ema: Option<EmaTeacher<B, M>>,
    best: BestWeights<M>,
    /// Current training state
    pub state: TrainingState,
}

impl<B, M> FixMatchTrainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + OpenSetNet<B>,
    M::InnerModule: OpenSetNet<B::InnerBackend>,
{
    pub fn new(model: M, config: TrainingConfig, fixmatch: FixMatchConfig, open_set: &OpenSetConfig) -> Self {
        info!(
            "FixMatch: threshold {}, lambda_u {}, unlabeled ratio {}, EMA {}",
            fixmatch.threshold, fixmatch.lambda_u, fixmatch.unlabeled_ratio, fixmatch.use_ema
        );
        let ema = fixmatch.use_ema.then(|| {
            EmaTeacher::new(
                &model,
                fixmatch.ema_decay,
                config.learning_rate * config.weight_decay,
            )
        });
        Self {
            optimizer: build_optimizer::<B, M>(&config, !fixmatch.use_ema),
            scheduler: LrScheduler::new(config.lr_schedule.clone(), config.learning_rate),
            gate: ConfidenceGate::new(open_set.threshold as f32),
            state: TrainingState::new(config.learning_rate),
            best: BestWeights::new(),
            model,
            config,
            fixmatch,
            ema,
        }
    }

    /// Continue from an existing teacher instead of a fresh copy of the student
    pub fn with_teacher(mut self, ema: EmaTeacher<B, M>) -> Self {
        if self.fixmatch.use_ema {
            self.ema = Some(ema);
        }
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn teacher(&self) -> Option<&EmaTeacher<B, M>> {
        self.ema.as_ref()
    }

    pub fn best(&self) -> &BestWeights<M> {
        &self.best
    }

    /// The network used for validation: the EMA teacher when enabled
    pub fn eval_model(&self) -> M::InnerModule {
        match &self.ema {
            Some(ema) => ema.model().clone(),
            None => self.model.valid(),
        }
    }

    /// One optimizer step on a labeled batch and an unlabeled pair
    pub fn train_step(&mut self, labeled: LabeledBatch<B>, unlabeled: UnlabeledBatch<B>) -> Result<StepStats> {
        let n_l = labeled.targets.dims()[0];
        let n_u = unlabeled.targets.dims()[0];

        let inputs = Tensor::cat(vec![labeled.images, unlabeled.weak, unlabeled.strong], 0);
        let logits = self.model.forward(inputs);
        let logits_l = logits.clone().slice([0..n_l]);
        let logits_weak = logits.clone().slice([n_l..n_l + n_u]);
        let logits_strong = logits.slice([n_l + n_u..n_l + 2 * n_u]);

        let loss_l = Criterion::CrossEntropy.forward(logits_l.clone(), labeled.targets.clone());
        let consistency = consistency_loss(logits_weak, logits_strong, self.fixmatch.threshold);
        let loss = loss_l.clone() + consistency.loss.clone().mul_scalar(self.fixmatch.lambda_u);

        let pseudo = host_i64(consistency.pseudo_labels, "pseudo-labels")?;
        let mask = host_f32(consistency.mask, "mask")?;
        let truth = host_i64(unlabeled.targets, "unlabeled labels")?;
        let (unlabeled_correct, unlabeled_total) = pseudo
            .iter()
            .zip(&mask)
            .zip(&truth)
            .filter(|((_, &m), &t)| m > 0.5 && t >= 0)
            .fold((0, 0), |(hits, seen), ((&p, _), &t)| (hits + usize::from(p == t), seen + 1));

        let stats = StepStats {
            loss: loss.clone().into_scalar().elem(),
            loss_labeled: loss_l.into_scalar().elem(),
            loss_unlabeled: consistency.loss.into_scalar().elem(),
            mask_rate: mask.iter().map(|&m| m as f64).sum::<f64>() / n_u.max(1) as f64,
            labeled_correct: batch_correct(logits_l, labeled.targets),
            labeled_total: n_l,
            unlabeled_correct,
            unlabeled_total,
        };

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self.optimizer.step(self.state.current_lr, self.model.clone(), grads);
        self.state.current_lr = self.scheduler.step();
        if let Some(ema) = self.ema.as_mut() {
            self.model = ema.update(self.model.clone())?;
        }

        self.state.iteration += 1;
        self.state.samples_seen += n_l + n_u;
        Ok(stats)
    }

    /// Run `steps` optimizer steps
    pub fn train_epoch(
        &mut self,
        labeled: &mut CyclingLoader<SampleItem, LabeledBatch<B>>,
        unlabeled: &mut PairLoader<B>,
        steps: usize,
    ) -> Result<EpochStats> {
        let mut losses = RunningAverage::new();
        let mut loss_l = RunningAverage::new();
        let mut loss_u = RunningAverage::new();
        let mut acc_l = AccuracyTracker::new();
        let mut acc_u = AccuracyTracker::new();
        let log_interval = self.config.log_interval.max(1);

        for step in 0..steps {
            let (Some(labeled_batch), Some(unlabeled_batch)) = (labeled.next(), unlabeled.next()) else {
                return Err(OpenSetError::Config(
                    "FixMatch needs non-empty labeled and unlabeled sets".to_string(),
                ));
            };
            let stats = self.train_step(labeled_batch, unlabeled_batch)?;

            losses.add(stats.loss);
            loss_l.add(stats.loss_labeled);
            loss_u.add(stats.loss_unlabeled);
            acc_l.add(stats.labeled_correct, stats.labeled_total);
            acc_u.add(stats.unlabeled_correct, stats.unlabeled_total);

            if (step + 1) % log_interval == 0 || step + 1 == steps {
                info!(
                    "  Step {}/{}: Acc_l {:.2}% | Acc_u {:.2}% | Xent_l {:.4} | Xent_u {:.4} | mask {:.2} | lr {:.6}",
                    step + 1,
                    steps,
                    acc_l.accuracy() * 100.0,
                    acc_u.accuracy() * 100.0,
                    loss_l.average(),
                    loss_u.average(),
                    stats.mask_rate,
                    self.state.current_lr
                );
            }
        }

        debug!("Unlabeled loader restarts so far: {}", unlabeled.restarts());
        self.state.record_train_loss(losses.average());
        Ok(EpochStats {
            loss: losses.average(),
            accuracy: acc_l.accuracy(),
            batches: losses.count(),
        })
    }

    /// Validation score. Without `ood` this is closed-set macro accuracy; with
    /// `ood` the gate is applied and the score is the gated macro-F1.
    /// `train_counts` only feeds the logged open-set report.
    pub fn evaluate(
        &self,
        loader: &mut LabeledLoader<B::InnerBackend>,
        ood: bool,
        train_counts: &[usize],
    ) -> Result<f64> {
        if !ood {
            return closed_set_accuracy(&self.eval_model(), loader);
        }
        let report = self.open_set_report(loader, train_counts)?;
        info!("\n{}", report);
        Ok(report.macro_f1)
    }

    /// Gated per-class report of the evaluation model
    pub fn open_set_report(
        &self,
        loader: &mut LabeledLoader<B::InnerBackend>,
        train_counts: &[usize],
    ) -> Result<OpenSetReport> {
        let predictions = OpenSetPredictor::new(self.gate).collect(&self.eval_model(), loader)?;
        predictions.report(&predictions.evaluated_classes(), train_counts)
    }

    /// Train every configured epoch. Improvements save the EMA teacher as
    /// `<stem>_ema`; the best student is written to `weights_path` at the end.
    pub fn train(
        &mut self,
        labeled: LabeledLoader<B>,
        unlabeled: &mut PairLoader<B>,
        val_loader: &mut LabeledLoader<B::InnerBackend>,
        weights_path: &Path,
    ) -> Result<()> {
        let steps = self
            .fixmatch
            .iterations_per_epoch
            .unwrap_or_else(|| labeled.num_batches());
        let mut labeled = CyclingLoader::new(labeled);
        let mut logger = StageLogger::new("fixmatch", self.config.epochs);

        for epoch in 0..self.config.epochs {
            self.state.epoch = epoch;
            logger.start_epoch(epoch);

            let stats = self.train_epoch(&mut labeled, unlabeled, steps)?;
            let score = self.evaluate(val_loader, false, &[])?;
            self.state.record_val_score(score);

            if self.best.update_best(&self.model, score, epoch) {
                if let Some(ema) = &self.ema {
                    ema.save(&sibling_path(weights_path, "_ema"))?;
                }
            }
            logger.end_epoch(stats.loss, score, self.state.current_lr);
        }

        logger.finish(self.best.score(), self.best.epoch());
        save_weights(self.best.best().unwrap_or(&self.model), weights_path)
    }

    /// Hand over the student, the best snapshot and the teacher
    pub fn into_parts(self) -> (M, BestWeights<M>, Option<EmaTeacher<B, M>>) {
        (self.model, self.best, self.ema)
    }
}
