//! Training CLI Tool
//!
//! Scans a class-per-directory image tree, splits it per class, trains the
//! convolutional classifier in two phases (warm-up, then augmented),
//! evaluates it on the held-out subset and writes the model archive.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use classifier_core::{
    load_toml_config, setup_cli_logging, NormalizationPolicy, PassMetrics, PipelineConfig,
    TrainingPhase,
};
use classifier_training::{
    backend_name,
    pipeline::{self, PreparedData},
    ArchitectureSpec, TrainingObserver,
};
use std::path::PathBuf;
use tracing::info;

/// Balanced Image Classifier Training Tool
#[derive(Parser, Debug)]
#[command(
    name = "classifier-train",
    about = "Train the balanced image classifier",
    long_about = "Train a convolutional image classifier on a directory with one \
                  subdirectory per class: balanced split, warm-up passes, augmented \
                  passes, evaluation and model archive."
)]
struct Args {
    /// Path to pipeline configuration file (TOML); defaults are used when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the dataset root directory
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the model archive path
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Override the split, shuffle and initialisation seeds
    #[arg(short, long, value_name = "SEED")]
    seed: Option<u64>,

    /// Override the number of warm-up passes
    #[arg(long, value_name = "N")]
    warmup_passes: Option<usize>,

    /// Override the number of augmented passes
    #[arg(long, value_name = "N")]
    augmented_passes: Option<usize>,

    /// Override batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Fit the pixel scaler once on the training split and reuse it
    #[arg(long)]
    fit_once: bool,

    /// Write the JSON evaluation report to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Replace an existing model archive
    #[arg(long)]
    overwrite: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Dry run (scan, split and check the architecture without training)
    #[arg(long)]
    dry_run: bool,
}

/// Drives one progress bar per training phase
struct ProgressObserver {
    style: ProgressStyle,
    bar: Option<ProgressBar>,
}

impl ProgressObserver {
    fn new() -> Result<Self> {
        let style = ProgressStyle::default_bar()
            .template("{msg:>18} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} passes ({eta})")
            .context("Invalid progress bar template")?
            .progress_chars("=>-");
        Ok(Self { style, bar: None })
    }
}

impl TrainingObserver for ProgressObserver {
    fn on_phase_start(&mut self, phase: TrainingPhase, passes: usize, samples: usize) {
        let bar = ProgressBar::new(passes as u64);
        bar.set_style(self.style.clone());
        bar.set_message(phase.to_string());
        bar.suspend(|| info!("Starting {} over {} samples", phase, samples));
        self.bar = Some(bar);
    }

    fn on_scaler_fitted(&mut self, phase: TrainingPhase, min: u8, max: u8) {
        let log = || info!("{}: pixel scaler fitted to [{}, {}]", phase, min, max);
        match &self.bar {
            Some(bar) => bar.suspend(log),
            None => log(),
        }
    }

    fn on_iteration(&mut self, _phase: TrainingPhase, iteration: usize, loss: f64) {
        if let Some(bar) = &self.bar {
            bar.suspend(|| info!("Score at iteration {} is {:.6}", iteration, loss));
        }
    }

    fn on_pass_end(&mut self, metrics: &PassMetrics) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
            bar.set_message(format!("loss {:.4}", metrics.mean_loss));
        }
    }

    fn on_phase_end(&mut self, phase: TrainingPhase) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{} done", phase));
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    println!("{}", "Balanced Image Classifier - Training".green().bold());

    let mut config = match &args.config {
        Some(path) => load_toml_config::<PipelineConfig>(path)
            .with_context(|| format!("Failed to load configuration file: {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    print_config_summary(&config);

    let prepared = pipeline::prepare_data(&config).context("Failed to prepare dataset")?;
    print_split_summary(&prepared);

    let spec = ArchitectureSpec::from_config(
        &config.architecture,
        config.data.image_size,
        prepared.split.num_labels(),
    )
    .context("Invalid architecture")?;
    print_architecture(&spec)?;

    if args.dry_run {
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    let outcome = pipeline::run(&config, ProgressObserver::new()?).context("Training failed")?;

    println!();
    println!("{}", "Evaluation Metrics:".cyan().bold());
    println!("{}", outcome.report);
    println!(
        "{} {}",
        "Model saved to".green().bold(),
        outcome.model_path.display()
    );
    if let Some(last) = outcome.trained.history().last() {
        info!(
            "Final pass: loss={:.4}, train acc={:.2}%, iterations={}",
            last.mean_loss,
            100.0 * last.accuracy,
            outcome.trained.history().iterations
        );
    }

    Ok(())
}

fn apply_overrides(config: &mut PipelineConfig, args: &Args) {
    if let Some(ref data_dir) = args.data_dir {
        config.data.data_dir = data_dir.clone();
    }
    if let Some(ref output) = args.output {
        config.output.model_path = output.clone();
    }
    if let Some(seed) = args.seed {
        config.split.seed = seed;
        config.training.shuffle_seed = seed;
        config.architecture.init_seed = seed;
    }
    if let Some(passes) = args.warmup_passes {
        config.training.warmup_passes = passes;
    }
    if let Some(passes) = args.augmented_passes {
        config.training.augmented_passes = passes;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if args.fit_once {
        config.training.normalization = NormalizationPolicy::FitOnce;
    }
    if let Some(ref report) = args.report {
        config.output.report_path = Some(report.clone());
    }
    if args.overwrite {
        config.output.overwrite_existing = true;
    }
}

fn print_config_summary(config: &PipelineConfig) {
    info!("Configuration Summary:");
    info!("  Backend: {}", backend_name());
    info!("  Data dir: {}", config.data.data_dir.display());
    info!("  Image size: {}", config.data.image_size);
    info!(
        "  Split: {}/{} (seed {})",
        config.split.train_percent, config.split.test_percent, config.split.seed
    );
    info!("  Batch size: {}", config.training.batch_size);
    info!(
        "  Passes: {} warm-up + {} augmented",
        config.training.warmup_passes, config.training.augmented_passes
    );
    info!("  Augmentation entries: {}", config.augmentation.entries.len());
    info!("  Normalization: {:?}", config.training.normalization);
    info!("  Output: {}", config.output.model_path.display());
}

fn print_split_summary(prepared: &PreparedData) {
    println!("{}", "Dataset Splits:".cyan().bold());
    println!("{}", prepared.index.stats());
    println!("{}", prepared.split.stats());
}

fn print_architecture(spec: &ArchitectureSpec) -> Result<()> {
    let shapes = spec.layer_shapes()?;
    info!("Architecture ({} -> {} classes):", spec.input(), spec.num_labels());
    for (layer, shape) in spec.layers().iter().zip(shapes) {
        info!("  {:<20} {}", layer.name(), shape);
    }
    Ok(())
}
