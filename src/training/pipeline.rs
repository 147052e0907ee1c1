//! Two-stage pipeline state machine
//!
//! `Stage1Train -> Stage1Calibrate -> (Stage2PseudoLabelInit -> Stage2Train) x rounds -> Terminal`
//!
//! Stages hand an owned [`StageSnapshot`] to each other. Everything persisted
//! lives under the pipeline's output directory:
//!
//! ```text
//! <output>/config.json
//! <output>/stage1/model.mpk            best Stage-1 weights
//! <output>/stage1/model_centroids.bin
//! <output>/stage1/model_conf_preds.bin
//! <output>/stage1/model_init_pseudo*.bin
//! <output>/stage2_round<r>/model.mpk   best Stage-2 weights of round r
//! <output>/stage2_round<r>/model_ema.mpk
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use tracing::info;

use super::deploy::MemoryDeployer;
use super::ema::EmaTeacher;
use super::fixmatch::FixMatchTrainer;
use super::pseudo_label::{PseudoLabelSet, PseudoLabeler};
use super::self_training::SelfTrainer;
use super::stage1::Stage1Trainer;
use super::LoaderFactory;
use crate::dataset::{InMemoryDataset, SeasonShiftData};
use crate::inference::reachability::CentroidTable;
use crate::inference::{ConfidenceGate, OpenSetPredictor};
use crate::model::config::{PipelineConfig, PseudoLabelStrategy, Stage2Strategy};
use crate::model::{BestWeights, OpenSetNet};
use crate::utils::error::{OpenSetError, Result};
use crate::utils::metrics::OpenSetReport;

/// Pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Stage1Train,
    Stage1Calibrate,
    Stage2PseudoLabelInit { round: usize },
    Stage2Train { round: usize },
    Terminal,
}

impl Stage {
    /// Successor state for a run with `rounds` Stage-2 rounds
    pub fn next(self, rounds: usize) -> Stage {
        match self {
            Stage::Stage1Train => Stage::Stage1Calibrate,
            Stage::Stage1Calibrate if rounds == 0 => Stage::Terminal,
            Stage::Stage1Calibrate => Stage::Stage2PseudoLabelInit { round: 0 },
            Stage::Stage2PseudoLabelInit { round } => Stage::Stage2Train { round },
            Stage::Stage2Train { round } if round + 1 < rounds => {
                Stage::Stage2PseudoLabelInit { round: round + 1 }
            }
            Stage::Stage2Train { .. } | Stage::Terminal => Stage::Terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Terminal)
    }

    /// Number of non-terminal states a run with `rounds` rounds goes through
    pub fn count(rounds: usize) -> usize {
        2 + 2 * rounds
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Stage1Train => write!(f, "stage1-train"),
            Stage::Stage1Calibrate => write!(f, "stage1-calibrate"),
            Stage::Stage2PseudoLabelInit { round } => write!(f, "stage2-pseudo-label-init (round {})", round),
            Stage::Stage2Train { round } => write!(f, "stage2-train (round {})", round),
            Stage::Terminal => write!(f, "terminal"),
        }
    }
}

/// Owned state handed from one stage to the next
pub struct StageSnapshot<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    /// Weights the next stage starts from
    pub model: M,
    /// Best-weights record of the stage that produced `model`
    pub best: BestWeights<M>,
    pub centroids: Option<CentroidTable>,
    pub pseudo_labels: Option<PseudoLabelSet>,
    pub ema: Option<EmaTeacher<B, M>>,
    /// Gated report on the test split after the latest training stage
    pub test_report: Option<OpenSetReport>,
}

impl<B, M> StageSnapshot<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    pub fn new(model: M) -> Self {
        Self {
            model,
            best: BestWeights::new(),
            centroids: None,
            pseudo_labels: None,
            ema: None,
            test_report: None,
        }
    }

    /// The frozen model used for evaluation and pseudo-labeling: the EMA teacher when present
    pub fn eval_model(&self) -> M::InnerModule {
        match &self.ema {
            Some(ema) => ema.model().clone(),
            None => self.model.valid(),
        }
    }
}

/// Datasets of one run
#[derive(Debug, Clone)]
pub struct PipelineData {
    /// Labeled source data
    pub labeled: InMemoryDataset,
    /// Unlabeled target data; labels are ground truth used only for logging
    pub target: InMemoryDataset,
    /// In-distribution validation split
    pub validation: InMemoryDataset,
    /// Test split, may contain unknowns
    pub test: InMemoryDataset,
}

impl From<SeasonShiftData> for PipelineData {
    fn from(data: SeasonShiftData) -> Self {
        Self {
            labeled: data.labeled,
            target: data.unlabeled,
            validation: data.validation,
            test: data.test,
        }
    }
}

/// Drives the stages of a run over a [`PipelineData`]
pub struct Pipeline<B: AutodiffBackend> {
    config: PipelineConfig,
    loaders: LoaderFactory<B>,
    output_dir: PathBuf,
}

impl<B: AutodiffBackend> Pipeline<B> {
    pub fn new(config: PipelineConfig, loaders: LoaderFactory<B>, output_dir: impl AsRef<Path>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            loaders,
            output_dir: output_dir.as_ref().to_path_buf(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Weights path of the Stage-1 model
    pub fn stage1_weights(&self) -> PathBuf {
        self.output_dir.join("stage1").join("model")
    }

    /// Weights path of Stage-2 round `round`
    pub fn round_weights(&self, round: usize) -> PathBuf {
        self.output_dir.join(format!("stage2_round{}", round)).join("model")
    }

    /// Run every stage from `Stage1Train` to `Terminal`
    pub fn run<M>(&self, model: M, data: &PipelineData) -> Result<StageSnapshot<B, M>>
    where
        M: AutodiffModule<B> + OpenSetNet<B>,
        M::InnerModule: OpenSetNet<B::InnerBackend>,
    {
        self.config.save(&self.output_dir.join("config.json"))?;

        let mut stage = Stage::Stage1Train;
        let mut snapshot = StageSnapshot::new(model);
        while !stage.is_terminal() {
            snapshot = self.run_stage(stage, snapshot, data)?;
            stage = stage.next(self.config.rounds);
        }

        info!("Pipeline finished, outputs in {:?}", self.output_dir);
        Ok(snapshot)
    }

    /// Run one stage
    pub fn run_stage<M>(
        &self,
        stage: Stage,
        snapshot: StageSnapshot<B, M>,
        data: &PipelineData,
    ) -> Result<StageSnapshot<B, M>>
    where
        M: AutodiffModule<B> + OpenSetNet<B>,
        M::InnerModule: OpenSetNet<B::InnerBackend>,
    {
        info!("==> {}", stage);
        match stage {
            Stage::Stage1Train => self.stage1_train(snapshot, data),
            Stage::Stage1Calibrate => self.stage1_calibrate(snapshot, data),
            Stage::Stage2PseudoLabelInit { round } => self.pseudo_label_init(round, snapshot, data),
            Stage::Stage2Train { round } => self.stage2_train(round, snapshot, data),
            Stage::Terminal => Ok(snapshot),
        }
    }

    fn train_counts<M: OpenSetNet<B>>(&self, model: &M, data: &PipelineData) -> Vec<usize> {
        data.labeled.class_counts(model.num_classes())
    }

    fn stage1_train<M>(&self, snapshot: StageSnapshot<B, M>, data: &PipelineData) -> Result<StageSnapshot<B, M>>
    where
        M: AutodiffModule<B> + OpenSetNet<B>,
        M::InnerModule: OpenSetNet<B::InnerBackend>,
    {
        let config = &self.config.stage1;
        let counts = self.train_counts(&snapshot.model, data);
        let mut train = self.loaders.train_loader(&data.labeled.known_only(), config.batch_size, config.seed);
        let mut val = self.loaders.eval_loader(&data.validation, config.batch_size);

        let mut trainer = Stage1Trainer::new(snapshot.model, config.clone(), &self.config.open_set);
        trainer.train(&mut train, &mut val, &counts)?;
        trainer.save_best(&self.stage1_weights())?;

        let (last, best) = trainer.into_parts();
        let mut next = StageSnapshot::new(best.revert(last));
        next.best = best;
        next.test_report = self.test_report(&next.eval_model(), data, &counts)?;
        Ok(next)
    }

    fn stage1_calibrate<M>(&self, mut snapshot: StageSnapshot<B, M>, data: &PipelineData) -> Result<StageSnapshot<B, M>>
    where
        M: AutodiffModule<B> + OpenSetNet<B>,
        M::InnerModule: OpenSetNet<B::InnerBackend>,
    {
        let batch_size = self.config.stage1.batch_size;
        let counts = self.train_counts(&snapshot.model, data);
        let mut labeled = self.loaders.eval_loader(&data.labeled.known_only(), batch_size);
        let mut target = self.loaders.eval_loader(&data.target, batch_size);

        let out = MemoryDeployer::new(self.config.open_set.clone()).deploy(
            &snapshot.model.valid(),
            &self.stage1_weights(),
            &mut labeled,
            &mut target,
            &counts,
            self.loaders.inner_device(),
        )?;

        snapshot.centroids = Some(out.centroids);
        snapshot.pseudo_labels = Some(out.pseudo_labels);
        Ok(snapshot)
    }

    /// Round 0 reuses the calibration pass when it matches the configured
    /// strategy; later rounds reuse what self-training left behind. Anything
    /// else is regenerated from the snapshot's frozen model.
    fn pseudo_label_init<M>(
        &self,
        round: usize,
        mut snapshot: StageSnapshot<B, M>,
        data: &PipelineData,
    ) -> Result<StageSnapshot<B, M>>
    where
        M: AutodiffModule<B> + OpenSetNet<B>,
        M::InnerModule: OpenSetNet<B::InnerBackend>,
    {
        let reuse = round > 0 || self.config.pseudo_labels == PseudoLabelStrategy::Reachability;
        let set = match snapshot.pseudo_labels.take() {
            Some(set) if reuse => set,
            _ => {
                let mut labeler = PseudoLabeler::new(self.config.pseudo_labels, &self.config.open_set);
                let mut target = self.loaders.eval_loader(&data.target, self.config.stage2.batch_size);
                labeler
                    .reset(
                        &snapshot.eval_model(),
                        &mut target,
                        snapshot.centroids.as_ref(),
                        self.loaders.inner_device(),
                    )?
                    .clone()
            }
        };

        info!("Round {} pseudo-labels: {}", round, set.stats());
        set.save(&self.round_weights(round))?;
        snapshot.pseudo_labels = Some(set);
        Ok(snapshot)
    }

    fn stage2_train<M>(
        &self,
        round: usize,
        mut snapshot: StageSnapshot<B, M>,
        data: &PipelineData,
    ) -> Result<StageSnapshot<B, M>>
    where
        M: AutodiffModule<B> + OpenSetNet<B>,
        M::InnerModule: OpenSetNet<B::InnerBackend>,
    {
        let config = &self.config.stage2;
        let weights = self.round_weights(round);
        let counts = self.train_counts(&snapshot.model, data);
        let seed = config.seed + round as u64;
        let set = snapshot
            .pseudo_labels
            .take()
            .ok_or_else(|| OpenSetError::Config(format!("round {} has no pseudo-labels", round)))?;
        let mut val = self.loaders.eval_loader(&data.validation, config.batch_size);

        let mut next = match self.config.stage2_strategy {
            Stage2Strategy::FixMatch => {
                let pool = data.target.select(&set.accepted_indices());
                if pool.items().is_empty() {
                    return Err(OpenSetError::Config(format!(
                        "round {}: no target example passed the gate, nothing to train FixMatch on",
                        round
                    )));
                }
                info!("FixMatch pool: {} of {} target examples", pool.items().len(), set.len());

                let mut trainer = FixMatchTrainer::new(
                    snapshot.model,
                    config.clone(),
                    self.config.fixmatch.clone(),
                    &self.config.open_set,
                );
                if let Some(ema) = snapshot.ema.take() {
                    trainer = trainer.with_teacher(ema);
                }

                let labeled = self.loaders.train_loader(&data.labeled.known_only(), config.batch_size, seed);
                let mut pairs = self.loaders.pair_loader(
                    &pool,
                    config.batch_size * self.config.fixmatch.unlabeled_ratio,
                    seed,
                );
                trainer.train(labeled, &mut pairs, &mut val, &weights)?;

                let (last, best, ema) = trainer.into_parts();
                let mut next = StageSnapshot::new(best.revert(last));
                next.best = best;
                next.ema = ema;
                next
            }
            Stage2Strategy::SelfTraining { margin_loss } => {
                let labeler = PseudoLabeler::new(self.config.pseudo_labels, &self.config.open_set);
                let margin = margin_loss.then(|| self.config.margin.clone());
                let mut trainer = SelfTrainer::new(snapshot.model, config.clone(), margin, labeler);
                trainer.use_pseudo_labels(set, &data.labeled, &data.target)?;
                trainer.train(
                    &data.labeled,
                    &data.target,
                    &mut val,
                    &self.loaders,
                    snapshot.centroids.as_ref(),
                    &weights,
                )?;

                let (model, best, labels) = trainer.into_parts();
                let mut next = StageSnapshot::new(model);
                next.best = best;
                next.pseudo_labels = labels;
                next
            }
        };

        // Stage-1 centroids stay the reference for later rounds
        next.centroids = snapshot.centroids;
        next.test_report = self.test_report(&next.eval_model(), data, &counts)?;
        Ok(next)
    }

    /// Gated evaluation on the test split, skipped when the split is empty
    fn test_report<N: OpenSetNet<B::InnerBackend>>(
        &self,
        model: &N,
        data: &PipelineData,
        train_counts: &[usize],
    ) -> Result<Option<OpenSetReport>> {
        if data.test.items().is_empty() {
            return Ok(None);
        }
        let mut test = self.loaders.eval_loader(&data.test, self.config.stage1.batch_size);
        let predictor = OpenSetPredictor::new(ConfidenceGate::new(self.config.open_set.threshold as f32));
        let predictions = predictor.collect(model, &mut test)?;
        let report = predictions.report(&predictions.evaluated_classes(), train_counts)?;
        info!("Test split:\n{}", report);
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{AugmentationConfig, SeasonShiftConfig};
    use crate::model::config::{FixMatchConfig, OpenSetConfig, TrainingConfig};
    use crate::model::{MlpNet, MlpNetConfig};
    use crate::training::scheduler::LrSchedule;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_transitions_with_two_rounds() {
        let mut stage = Stage::Stage1Train;
        let mut visited = vec![stage];
        while !stage.is_terminal() {
            stage = stage.next(2);
            visited.push(stage);
        }
        assert_eq!(
            visited,
            vec![
                Stage::Stage1Train,
                Stage::Stage1Calibrate,
                Stage::Stage2PseudoLabelInit { round: 0 },
                Stage::Stage2Train { round: 0 },
                Stage::Stage2PseudoLabelInit { round: 1 },
                Stage::Stage2Train { round: 1 },
                Stage::Terminal,
            ]
        );
        assert_eq!(visited.len() - 1, Stage::count(2));
    }

    #[test]
    fn test_zero_rounds_stops_after_calibration() {
        assert_eq!(Stage::Stage1Calibrate.next(0), Stage::Terminal);
        assert_eq!(Stage::Terminal.next(3), Stage::Terminal);
        assert_eq!(Stage::Stage2Train { round: 0 }.to_string(), "stage2-train (round 0)");
    }

    fn data() -> PipelineData {
        SeasonShiftData::generate(&SeasonShiftConfig {
            num_classes: 3,
            feature_dim: 6,
            labeled_per_class: 4,
            unlabeled_per_class: 6,
            test_per_class: 4,
            ood_count: 3,
            season_shift: 0.2,
            seed: 11,
            ..Default::default()
        })
        .unwrap()
        .into()
    }

    fn config(strategy: Stage2Strategy, rounds: usize) -> PipelineConfig {
        let training = TrainingConfig {
            epochs: 3,
            batch_size: 6,
            learning_rate: 0.05,
            lr_schedule: LrSchedule::Constant,
            log_interval: 5,
            ..Default::default()
        };
        PipelineConfig {
            stage1: training.clone(),
            stage2: TrainingConfig { epochs: 2, ..training },
            open_set: OpenSetConfig {
                threshold: 0.0,
                ..Default::default()
            },
            fixmatch: FixMatchConfig {
                threshold: 0.5,
                iterations_per_epoch: Some(2),
                ..Default::default()
            },
            stage2_strategy: strategy,
            rounds,
            ..Default::default()
        }
    }

    fn factory() -> LoaderFactory<TestBackend> {
        LoaderFactory::<TestBackend>::new(Default::default())
            .with_augmentation(AugmentationConfig::none(), AugmentationConfig::weak())
    }

    #[test]
    fn test_self_training_run_writes_every_round() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = data();
        let pipeline = Pipeline::new(
            config(Stage2Strategy::SelfTraining { margin_loss: true }, 2),
            factory(),
            dir.path(),
        )
        .unwrap();
        let model: MlpNet<TestBackend> = MlpNetConfig::new(6, 3).init(&Default::default());

        let snapshot = pipeline.run(model, &data).unwrap();

        let out = dir.path();
        assert!(out.join("config.json").exists());
        assert!(out.join("stage1/model.mpk").exists());
        assert!(out.join("stage1/model_centroids.bin").exists());
        assert!(out.join("stage1/model_conf_preds.bin").exists());
        assert!(out.join("stage1/model_init_pseudo.bin").exists());
        for round in 0..2 {
            assert!(out.join(format!("stage2_round{}/model.mpk", round)).exists());
            assert!(out.join(format!("stage2_round{}/model_init_pseudo.bin", round)).exists());
        }

        assert!(snapshot.centroids.is_some());
        assert!(snapshot.ema.is_none());
        let labels = snapshot.pseudo_labels.unwrap();
        assert_eq!(labels.len(), data.target.items().len());
        assert!(snapshot.test_report.is_some());
    }

    #[test]
    fn test_fixmatch_run_keeps_teacher() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = data();
        let pipeline = Pipeline::new(config(Stage2Strategy::FixMatch, 1), factory(), dir.path()).unwrap();
        let model: MlpNet<TestBackend> = MlpNetConfig::new(6, 3).init(&Default::default());

        let snapshot = pipeline.run(model, &data).unwrap();

        assert!(dir.path().join("stage2_round0/model.mpk").exists());
        assert!(dir.path().join("stage2_round0/model_ema.mpk").exists());
        let ema = snapshot.ema.unwrap();
        assert_eq!(ema.updates(), 4);
        assert!(snapshot.pseudo_labels.is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.fixmatch.unlabeled_ratio = 0;
        let result = Pipeline::new(config, factory(), "unused");
        assert!(matches!(result, Err(OpenSetError::Config(_))));
    }
}
