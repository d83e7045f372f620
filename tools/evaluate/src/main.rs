//! Evaluation CLI Tool
//!
//! Loads a model archive written by `classifier-train`, rebuilds the balanced
//! split of the dataset from the same seed and reports metrics on the test
//! subset.

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use classifier_core::{load_toml_config, setup_cli_logging, PipelineConfig};
use classifier_dataset::ImageLoader;
use classifier_training::{default_device, pipeline, CpuBackend, Evaluator, ModelStore};
use std::path::PathBuf;
use tracing::info;

/// Balanced Image Classifier Evaluation Tool
#[derive(Parser, Debug)]
#[command(
    name = "classifier-evaluate",
    about = "Evaluate a trained classifier archive",
    long_about = "Evaluate a saved model archive on the test subset of its dataset and \
                  report accuracy, per-class precision/recall/F1 and the confusion matrix."
)]
struct Args {
    /// Path to the model archive
    #[arg(short, long, value_name = "FILE", default_value = "cnntrainedmodel.bin")]
    model: PathBuf,

    /// Pipeline configuration used for training (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the dataset root directory
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the split seed; must match the one used for training
    #[arg(short, long, value_name = "SEED")]
    seed: Option<u64>,

    /// Batch size for evaluation
    #[arg(short, long, default_value = "32")]
    batch_size: usize,

    /// Write the JSON report to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Export the confusion matrix to CSV
    #[arg(long, value_name = "FILE")]
    export_confusion_matrix: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    println!("{}", "Balanced Image Classifier - Evaluation".green().bold());

    let mut config = match &args.config {
        Some(path) => load_toml_config::<PipelineConfig>(path)
            .with_context(|| format!("Failed to load configuration file: {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(ref data_dir) = args.data_dir {
        config.data.data_dir = data_dir.clone();
    }
    if let Some(seed) = args.seed {
        config.split.seed = seed;
    }

    let header = ModelStore::read_header(&args.model)
        .with_context(|| format!("Failed to read model archive: {}", args.model.display()))?;
    info!(
        "Archive v{} created {} ({} labels, {} training iterations)",
        header.format_version,
        header.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        header.labels.len(),
        header.history.iterations
    );
    // The loader must produce what the network was built for
    config.data.image_size = header.input;

    let prepared = pipeline::prepare_data(&config).context("Failed to prepare dataset")?;
    if prepared.split.labels != header.labels {
        bail!(
            "Dataset labels {:?} do not match the model's labels {:?}",
            prepared.split.labels,
            header.labels
        );
    }
    info!("Evaluating on {} test samples", prepared.split.test.len());

    let device = default_device();
    let trained = ModelStore::load::<CpuBackend>(&args.model, &device)
        .with_context(|| format!("Failed to load model: {}", args.model.display()))?;

    let report = Evaluator::new(ImageLoader::from_config(&config.data), args.batch_size)
        .evaluate(&trained, &prepared.split.test)
        .context("Evaluation failed")?;

    println!();
    println!("{}", "Evaluation Metrics:".cyan().bold());
    println!("{}", report);
    if let Some(f1) = report.macro_f1() {
        println!("{} {:.4}", "Macro F1:".bold(), f1);
    }

    if let Some(ref path) = args.report {
        report
            .save_json(path)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        info!("Report saved to: {}", path.display());
    }
    if let Some(ref path) = args.export_confusion_matrix {
        report
            .export_confusion_csv(path)
            .with_context(|| format!("Failed to write confusion matrix: {}", path.display()))?;
        info!("Confusion matrix saved to: {}", path.display());
    }

    Ok(())
}
