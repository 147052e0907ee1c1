//! Open-Set Semi-Supervised Learning CLI
//!
//! Runs the two training stages on dense data directories (or on generated
//! season-shift data) and writes weights and artifacts to timestamped run
//! directories.
//!
//! A data directory holds `manifest.json` plus `<split>_features.bin` (f32)
//! and `<split>_categories.bin` (i64) for the splits `labeled`, `target`,
//! `validation` and `test`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::module::AutodiffModule;
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use openset_ssl::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
use openset_ssl::dataset::ClassIndex;
use openset_ssl::inference::CentroidTable;
use openset_ssl::model::config::BackboneKind;
use openset_ssl::model::{load_weights, CnnNetConfig, MlpNetConfig};
use openset_ssl::training::{LoaderFactory, LrSchedule, Pipeline, PipelineData, PseudoLabelSet, Stage, Stage1Trainer, StageSnapshot};
use openset_ssl::utils::artifacts::{self, sibling_path};
use openset_ssl::utils::logging::{init_logging, LogConfig, LogLevel};
use openset_ssl::{
    InMemoryDataset, MemoryDeployer, ModelConfig, OpenSetNet, OpenSetReport, PipelineConfig, SeasonShiftConfig,
    SeasonShiftData, Stage2Strategy, UNKNOWN_CLASS,
};

/// Two-stage open-set semi-supervised training
#[derive(Parser, Debug)]
#[command(name = "openset_ssl")]
#[command(version)]
#[command(about = "Open-set semi-supervised training with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false")]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error); overrides --verbose and --quiet
    #[arg(long)]
    log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a season-shift data directory
    Synth {
        /// Output data directory
        #[arg(short, long, default_value = "data/synth")]
        output_dir: String,

        #[arg(long, default_value = "3")]
        num_classes: usize,

        #[arg(long, default_value = "8")]
        feature_dim: usize,

        #[arg(long, default_value = "20")]
        labeled_per_class: usize,

        #[arg(long, default_value = "100")]
        unlabeled_per_class: usize,

        /// Out-of-distribution examples in the target and test splits
        #[arg(long, default_value = "30")]
        ood_count: usize,

        /// Mean shift between the source and target seasons
        #[arg(long, default_value = "0.5")]
        season_shift: f32,

        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Train Stage 1 on the labeled split
    Stage1 {
        #[arg(short, long)]
        data_dir: String,

        /// Run configuration (JSON); defaults when omitted
        #[arg(short, long)]
        config: Option<String>,

        #[arg(short, long, default_value = "output/runs")]
        output_dir: String,

        #[arg(short, long)]
        epochs: Option<usize>,

        /// Confidence threshold of the gate (0.0-1.0)
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Calibrate a Stage-1 model with class centroids and label the target split
    Deploy {
        #[arg(short, long)]
        data_dir: String,

        /// Stage-1 weights, without the `.mpk` extension
        #[arg(short, long)]
        weights: String,

        #[arg(short, long)]
        config: Option<String>,

        #[arg(long)]
        threshold: Option<f64>,

        #[arg(long)]
        reachability_scale: Option<f64>,

        /// Also write the calibrated logits as soft pseudo-labels
        #[arg(long, default_value = "false")]
        soft: bool,
    },

    /// Run the Stage-2 rounds starting from calibrated Stage-1 weights
    Stage2 {
        #[arg(short, long)]
        data_dir: String,

        /// Stage-1 weights, without the `.mpk` extension
        #[arg(short, long)]
        weights: String,

        #[arg(short, long)]
        config: Option<String>,

        #[arg(short, long, default_value = "output/runs")]
        output_dir: String,

        #[arg(long)]
        strategy: Option<StrategyArg>,

        #[arg(long)]
        rounds: Option<usize>,
    },

    /// Run every stage end to end
    Pipeline {
        /// Data directory; generated season-shift data when omitted
        #[arg(short, long)]
        data_dir: Option<String>,

        #[arg(short, long)]
        config: Option<String>,

        #[arg(short, long, default_value = "output/runs")]
        output_dir: String,

        #[arg(long)]
        strategy: Option<StrategyArg>,

        #[arg(long)]
        rounds: Option<usize>,

        /// Seed of the generated data
        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Fixmatch,
    SelfTraining,
    /// Self-training with plain cross entropy
    SelfTrainingCe,
}

impl From<StrategyArg> for Stage2Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Fixmatch => Stage2Strategy::FixMatch,
            StrategyArg::SelfTraining => Stage2Strategy::SelfTraining { margin_loss: true },
            StrategyArg::SelfTrainingCe => Stage2Strategy::SelfTraining { margin_loss: false },
        }
    }
}

/// Layout of a data directory
#[derive(Debug, Serialize, Deserialize)]
struct DataManifest {
    shape: [usize; 3],
    classes: ClassIndex,
}

const SPLITS: [&str; 4] = ["labeled", "target", "validation", "test"];

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };
    if let Some(level) = &cli.log_level {
        log_config.level = LogLevel::parse(level);
    }
    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Synth {
            output_dir,
            num_classes,
            feature_dim,
            labeled_per_class,
            unlabeled_per_class,
            ood_count,
            season_shift,
            seed,
        } => {
            let config = SeasonShiftConfig {
                num_classes,
                feature_dim,
                labeled_per_class,
                unlabeled_per_class,
                ood_count,
                season_shift,
                seed,
                ..Default::default()
            };
            cmd_synth(&config, Path::new(&output_dir))?;
        }

        Commands::Stage1 {
            data_dir,
            config,
            output_dir,
            epochs,
            threshold,
        } => {
            let (data, manifest) = load_data_dir(Path::new(&data_dir))?;
            let mut config = load_config(config.as_deref(), &manifest)?;
            if let Some(epochs) = epochs {
                config.stage1.epochs = epochs;
            }
            if let Some(threshold) = threshold {
                config.open_set.threshold = threshold;
            }
            config.validate()?;

            let run_dir = run_dir(&output_dir);
            config.save(&run_dir.join("config.json"))?;
            match config.model.backbone {
                BackboneKind::Mlp => cmd_stage1(mlp(&config.model), &config, &data, &run_dir)?,
                BackboneKind::Cnn => cmd_stage1(cnn(&config.model), &config, &data, &run_dir)?,
            }
        }

        Commands::Deploy {
            data_dir,
            weights,
            config,
            threshold,
            reachability_scale,
            soft,
        } => {
            let (data, manifest) = load_data_dir(Path::new(&data_dir))?;
            let mut config = load_config(config.as_deref(), &manifest)?;
            if let Some(threshold) = threshold {
                config.open_set.threshold = threshold;
            }
            if let Some(scale) = reachability_scale {
                config.open_set.reachability_scale = scale;
            }
            config.open_set.soft_pseudo_labels |= soft;
            config.validate()?;

            let weights = PathBuf::from(weights);
            match config.model.backbone {
                BackboneKind::Mlp => cmd_deploy(mlp(&config.model), &config, &data, &weights)?,
                BackboneKind::Cnn => cmd_deploy(cnn(&config.model), &config, &data, &weights)?,
            }
        }

        Commands::Stage2 {
            data_dir,
            weights,
            config,
            output_dir,
            strategy,
            rounds,
        } => {
            let (data, manifest) = load_data_dir(Path::new(&data_dir))?;
            let from_file = config.is_some();
            let mut config = load_config(config.as_deref(), &manifest)?;
            apply_stage2_overrides(&mut config, strategy, rounds, from_file, data.labeled.items().len());
            if config.rounds == 0 {
                bail!("stage2 needs at least one round");
            }
            config.validate()?;

            let run_dir = run_dir(&output_dir);
            config.save(&run_dir.join("config.json"))?;
            let weights = PathBuf::from(weights);
            match config.model.backbone {
                BackboneKind::Mlp => cmd_stage2(mlp(&config.model), config, &data, &weights, &run_dir)?,
                BackboneKind::Cnn => cmd_stage2(cnn(&config.model), config, &data, &weights, &run_dir)?,
            }
        }

        Commands::Pipeline {
            data_dir,
            config,
            output_dir,
            strategy,
            rounds,
            seed,
        } => {
            let (data, manifest) = match data_dir {
                Some(dir) => load_data_dir(Path::new(&dir))?,
                None => {
                    let generated = SeasonShiftData::generate(&SeasonShiftConfig {
                        seed,
                        ..Default::default()
                    })?;
                    let manifest = manifest_for(&generated.labeled, SeasonShiftConfig::default().num_classes);
                    (PipelineData::from(generated), manifest)
                }
            };
            let from_file = config.is_some();
            let mut config = load_config(config.as_deref(), &manifest)?;
            apply_stage2_overrides(&mut config, strategy, rounds, from_file, data.labeled.items().len());
            config.validate()?;

            let run_dir = run_dir(&output_dir);
            match config.model.backbone {
                BackboneKind::Mlp => cmd_pipeline(mlp(&config.model), config, &data, &run_dir)?,
                BackboneKind::Cnn => cmd_pipeline(cnn(&config.model), config, &data, &run_dir)?,
            }
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 +--------------------------------------------------------------+
 |   Open-Set Semi-Supervised Learning                          |
 |   Stage 1 + centroid calibration + FixMatch / self-training  |
 +--------------------------------------------------------------+
  "#
        .green()
    );
    println!("  v{} | Backend: {}\n", openset_ssl::VERSION, backend_name().cyan());
}

fn mlp(config: &ModelConfig) -> openset_ssl::MlpNet<TrainingBackend> {
    MlpNetConfig::new(config.input_dim(), config.num_classes)
        .with_feature_dim(config.feature_dim)
        .with_dropout_rate(config.dropout_rate)
        .init(&default_device())
}

fn cnn(config: &ModelConfig) -> openset_ssl::CnnNet<TrainingBackend> {
    CnnNetConfig::new(config.num_classes)
        .with_in_channels(config.input_shape[0])
        .with_base_filters(config.base_filters)
        .with_dropout_rate(config.dropout_rate)
        .init(&default_device())
}

fn run_dir(output_dir: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let dir = Path::new(output_dir).join(format!("run_{}", stamp));
    info!("Run directory: {:?}", dir);
    dir
}

fn progress_bar(len: u64, prefix: &'static str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template("{prefix:>8} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}")?
            .progress_chars("#>-"),
    );
    pb.set_prefix(prefix);
    Ok(pb)
}

fn print_report(title: &str, report: &OpenSetReport) {
    println!();
    println!("{}", title.green().bold());
    println!("{}", report);
    println!(
        "  {} {:.2}%   {} {:.2}%   {} {:.2}%",
        "macro F1".cyan(),
        report.macro_f1 * 100.0,
        "FP".cyan(),
        report.fp_pct * 100.0,
        "unknown".cyan(),
        report.unknown_pct * 100.0
    );
}

/// Manifest of generated data: categories `0..K` are known, `K` is out-of-distribution
fn manifest_for(dataset: &InMemoryDataset, num_classes: usize) -> DataManifest {
    let known: Vec<u64> = (0..num_classes as u64).collect();
    DataManifest {
        shape: dataset.shape(),
        classes: ClassIndex::new(&known).with_unknown(&[num_classes as u64]),
    }
}

fn load_data_dir(dir: &Path) -> Result<(PipelineData, DataManifest)> {
    let manifest_path = dir.join("manifest.json");
    let json = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("reading {:?}; generate one with `openset_ssl synth`", manifest_path))?;
    let manifest: DataManifest = serde_json::from_str(&json)?;

    let load = |split: &str| -> Result<InMemoryDataset> {
        InMemoryDataset::from_dump(
            &dir.join(format!("{}_features.bin", split)),
            &dir.join(format!("{}_categories.bin", split)),
            manifest.shape,
            &manifest.classes,
        )
        .with_context(|| format!("loading split `{}` from {:?}", split, dir))
    };

    let data = PipelineData {
        labeled: load("labeled")?,
        target: load("target")?,
        validation: load("validation")?,
        test: load("test")?,
    };
    Ok((data, manifest))
}

fn load_config(path: Option<&str>, manifest: &DataManifest) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(Path::new(path)).with_context(|| format!("loading config {}", path))?,
        None => PipelineConfig::default(),
    };
    config.model.input_shape = manifest.shape;
    config.model.num_classes = manifest.classes.num_classes();
    Ok(config)
}

/// `--strategy fixmatch` without a config file also switches Stage 2 to the
/// per-step FixMatch cosine schedule
fn apply_stage2_overrides(
    config: &mut PipelineConfig,
    strategy: Option<StrategyArg>,
    rounds: Option<usize>,
    from_file: bool,
    labeled_len: usize,
) {
    if let Some(strategy) = strategy {
        config.stage2_strategy = strategy.into();
        if !from_file && config.stage2_strategy == Stage2Strategy::FixMatch {
            let steps = config
                .fixmatch
                .iterations_per_epoch
                .unwrap_or_else(|| labeled_len.div_ceil(config.stage2.batch_size.max(1)));
            config.stage2.lr_schedule = LrSchedule::fixmatch_cosine(steps * config.stage2.epochs);
        }
    }
    if let Some(rounds) = rounds {
        config.rounds = rounds;
    }
}

fn cmd_synth(config: &SeasonShiftConfig, output_dir: &Path) -> Result<()> {
    let data = SeasonShiftData::generate(config)?;
    let manifest = manifest_for(&data.labeled, config.num_classes);
    let data = PipelineData::from(data);

    std::fs::create_dir_all(output_dir)?;
    for (split, dataset) in SPLITS.iter().zip([&data.labeled, &data.target, &data.validation, &data.test]) {
        let features: Vec<f32> = dataset.items().iter().flat_map(|item| item.image.iter().copied()).collect();
        let categories: Vec<i64> = dataset
            .items()
            .iter()
            .map(|item| if item.label == UNKNOWN_CLASS { config.num_classes as i64 } else { item.label })
            .collect();
        artifacts::write_f32(&output_dir.join(format!("{}_features.bin", split)), &features)?;
        artifacts::write_i64(&output_dir.join(format!("{}_categories.bin", split)), &categories)?;
        println!("  {:<10} {} examples", split, categories.len());
    }
    std::fs::write(output_dir.join("manifest.json"), serde_json::to_string_pretty(&manifest)?)?;

    println!("{} {:?}", "Data written to".green(), output_dir);
    Ok(())
}

fn cmd_stage1<M>(model: M, config: &PipelineConfig, data: &PipelineData, run_dir: &Path) -> Result<()>
where
    M: AutodiffModule<TrainingBackend> + OpenSetNet<TrainingBackend>,
    M::InnerModule: OpenSetNet<DefaultBackend>,
{
    let stage = &config.stage1;
    let loaders = LoaderFactory::<TrainingBackend>::new(default_device());
    let weights = run_dir.join("stage1").join("model");
    let counts = data.labeled.class_counts(config.model.num_classes);

    let mut train = loaders.train_loader(&data.labeled.known_only(), stage.batch_size, stage.seed);
    let mut val = loaders.eval_loader(&data.validation, stage.batch_size);
    let mut trainer = Stage1Trainer::new(model, stage.clone(), &config.open_set);

    let pb = progress_bar(stage.epochs as u64, "stage1")?;
    for epoch in 0..stage.epochs {
        let (stats, score) = trainer.run_epoch(epoch, &mut train, &mut val, &counts)?;
        pb.set_message(format!(
            "loss {:.4} | acc {:.2}% | val F1 {:.2}%",
            stats.loss,
            stats.accuracy * 100.0,
            score * 100.0
        ));
        pb.inc(1);
    }
    pb.finish_with_message(format!(
        "best val F1 {:.2}% at epoch {}",
        trainer.best().score() * 100.0,
        trainer.best().epoch() + 1
    ));

    trainer.save_best(&weights)?;
    trainer.restore_best();
    let mut test = loaders.eval_loader(&data.test, stage.batch_size);
    let report = trainer.evaluate_test(&mut test, &counts, &weights)?;
    print_report("Stage-1 test split", &report);
    println!("\n{} {:?}", "Weights:".green(), weights);
    Ok(())
}

fn cmd_deploy<M>(model: M, config: &PipelineConfig, data: &PipelineData, weights: &Path) -> Result<()>
where
    M: AutodiffModule<TrainingBackend> + OpenSetNet<TrainingBackend>,
    M::InnerModule: OpenSetNet<DefaultBackend>,
{
    let loaders = LoaderFactory::<TrainingBackend>::new(default_device());
    let model = load_weights(model, weights, loaders.device())?.valid();
    let batch_size = config.stage1.batch_size;
    let counts = data.labeled.class_counts(config.model.num_classes);

    let mut labeled = loaders.eval_loader(&data.labeled.known_only(), batch_size);
    let mut target = loaders.eval_loader(&data.target, batch_size);
    let out = MemoryDeployer::new(config.open_set.clone()).deploy(
        &model,
        weights,
        &mut labeled,
        &mut target,
        &counts,
        loaders.inner_device(),
    )?;

    print_report("Calibrated target split", &out.report);
    println!("\n{}", out.pseudo_labels.stats());
    Ok(())
}

fn cmd_stage2<M>(model: M, config: PipelineConfig, data: &PipelineData, weights: &Path, run_dir: &Path) -> Result<()>
where
    M: AutodiffModule<TrainingBackend> + OpenSetNet<TrainingBackend>,
    M::InnerModule: OpenSetNet<DefaultBackend>,
{
    let loaders = LoaderFactory::<TrainingBackend>::new(default_device());
    let model = load_weights(model, weights, loaders.device())?;
    let num_classes = model.num_classes();

    let mut labeled = loaders.eval_loader(&data.labeled.known_only(), config.stage1.batch_size);
    let centroids = CentroidTable::load_or_compute(&sibling_path(weights, "_centroids.bin"), &model.valid(), &mut labeled)?;

    let mut snapshot = StageSnapshot::new(model);
    snapshot.centroids = Some(centroids);
    snapshot.pseudo_labels = match PseudoLabelSet::load(weights, num_classes) {
        Ok(set) if set.len() == data.target.items().len() => Some(set),
        Ok(set) => {
            warn!(
                "Ignoring stored pseudo-labels: {} entries for {} target examples",
                set.len(),
                data.target.items().len()
            );
            None
        }
        Err(e) => {
            info!("No stored pseudo-labels ({}), regenerating", e);
            None
        }
    };

    let rounds = config.rounds;
    let pipeline = Pipeline::new(config, loaders, run_dir)?;
    let pb = progress_bar(2 * rounds as u64, "stage2")?;
    let mut stage = Stage::Stage2PseudoLabelInit { round: 0 };
    while !stage.is_terminal() {
        pb.set_message(stage.to_string());
        snapshot = pipeline.run_stage(stage, snapshot, data)?;
        stage = stage.next(rounds);
        pb.inc(1);
    }
    pb.finish_with_message("done");

    if let Some(report) = &snapshot.test_report {
        print_report("Stage-2 test split", report);
    }
    println!("\n{} {:?}", "Outputs:".green(), pipeline.output_dir());
    Ok(())
}

fn cmd_pipeline<M>(model: M, config: PipelineConfig, data: &PipelineData, run_dir: &Path) -> Result<()>
where
    M: AutodiffModule<TrainingBackend> + OpenSetNet<TrainingBackend>,
    M::InnerModule: OpenSetNet<DefaultBackend>,
{
    let loaders = LoaderFactory::<TrainingBackend>::new(default_device());
    config.save(&run_dir.join("config.json"))?;
    let rounds = config.rounds;
    let pipeline = Pipeline::new(config, loaders, run_dir)?;

    let pb = progress_bar(Stage::count(rounds) as u64, "pipeline")?;
    let mut snapshot = StageSnapshot::new(model);
    let mut stage = Stage::Stage1Train;
    while !stage.is_terminal() {
        pb.set_message(stage.to_string());
        snapshot = pipeline.run_stage(stage, snapshot, data)?;
        let trained = matches!(stage, Stage::Stage1Train | Stage::Stage2Train { .. });
        if let (true, Some(report)) = (trained, &snapshot.test_report) {
            pb.println(format!(
                "{:>8} {} | test macro F1 {:.2}% | unknown {:.2}%",
                "",
                stage,
                report.macro_f1 * 100.0,
                report.unknown_pct * 100.0
            ));
        }
        stage = stage.next(rounds);
        pb.inc(1);
    }
    pb.finish_with_message("done");

    if let Some(report) = &snapshot.test_report {
        print_report("Final test split", report);
    }
    println!("\n{} {:?}", "Outputs:".green(), pipeline.output_dir());
    Ok(())
}
