//! End-to-end orchestration: scan, split, train, evaluate, save.

use std::path::PathBuf;

use classifier_core::{EvaluationReport, PersistenceError, PipelineConfig, Result};
use classifier_dataset::{AugmentationPipeline, BalancedSplitter, ImageLoader, SampleIndex, Split, SplitStats};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::architecture::ArchitectureSpec;
use crate::backend::{default_device, CpuBackend, TrainingBackend};
use crate::evaluator::Evaluator;
use crate::model_store::ModelStore;
use crate::observer::TrainingObserver;
use crate::trainer::{TrainedModel, Trainer};

/// The scanned index and its balanced split
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub index: SampleIndex,
    pub split: Split,
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct PipelineOutcome {
    pub split_stats: SplitStats,
    pub trained: TrainedModel<CpuBackend>,
    pub report: EvaluationReport,
    pub model_path: PathBuf,
}

/// Validates `config`, scans the data directory and splits it.
///
/// The split only depends on the directory contents and `config.split.seed`,
/// so the evaluate tool can rebuild the same test subset later.
pub fn prepare_data(config: &PipelineConfig) -> Result<PreparedData> {
    config.validate()?;

    let index = SampleIndex::scan(&config.data.data_dir, &config.data.allowed_extensions)?;
    info!("{}", index.stats());

    let splitter = BalancedSplitter::from_config(&config.split)?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.split.seed);
    let split = splitter.split(&index, &mut rng)?;

    Ok(PreparedData { index, split })
}

/// Builds the configured architecture and runs both training phases.
pub fn train(
    config: &PipelineConfig,
    prepared: &PreparedData,
    observer: impl TrainingObserver + 'static,
) -> Result<TrainedModel<CpuBackend>> {
    let spec = ArchitectureSpec::from_config(
        &config.architecture,
        config.data.image_size,
        prepared.split.num_labels(),
    )?;
    let augmentation = AugmentationPipeline::from_config(&config.augmentation)?;

    let trainer = Trainer::<TrainingBackend>::new(
        spec,
        config.training.clone(),
        ImageLoader::from_config(&config.data),
        default_device(),
    )?
    .with_observer(observer);

    trainer.fit(&prepared.split, augmentation)
}

/// Evaluates `trained` on the test subset of `prepared`.
pub fn evaluate(
    config: &PipelineConfig,
    prepared: &PreparedData,
    trained: &TrainedModel<CpuBackend>,
) -> Result<EvaluationReport> {
    Evaluator::new(ImageLoader::from_config(&config.data), config.training.batch_size)
        .evaluate(trained, &prepared.split.test)
}

/// Runs the whole pipeline and writes the model archive, plus the JSON
/// report when `config.output.report_path` is set.
///
/// An existing archive without `overwrite_existing` is reported before any
/// data is read.
pub fn run(config: &PipelineConfig, observer: impl TrainingObserver + 'static) -> Result<PipelineOutcome> {
    let model_path = config.output.model_path.clone();
    if !config.output.overwrite_existing && model_path.exists() {
        return Err(PersistenceError::DestinationExists(model_path).into());
    }

    let prepared = prepare_data(config)?;
    let trained = train(config, &prepared, observer)?;
    let report = evaluate(config, &prepared, &trained)?;

    ModelStore::save(&trained, &model_path, config.output.overwrite_existing)?;

    if let Some(report_path) = &config.output.report_path {
        report
            .save_json(report_path)
            .map_err(|source| PersistenceError::Io {
                path: report_path.clone(),
                source,
            })?;
        info!("Wrote evaluation report to {:?}", report_path);
    }

    Ok(PipelineOutcome {
        split_stats: prepared.split.stats(),
        trained,
        report,
        model_path,
    })
}
