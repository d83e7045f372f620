//! Configuration structures for the training pipeline.
//!
//! Defaults reproduce the reference experiment: 30x30 RGB input, batch size
//! 10, an 80/20 balanced split seeded with 42, 100 warm-up passes followed by
//! 10 augmented passes.

use crate::error::ConfigurationError;
use crate::types::ImageDimensions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Image formats accepted by the sample index.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "bmp", "gif", "jpg", "jpeg", "jp2", "pbm", "pgm", "ppm", "pnm", "png", "tif", "tiff",
];

/// Main configuration for a training run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Input data configuration
    pub data: DataConfig,
    /// Balanced split configuration
    pub split: SplitConfig,
    /// Augmentation pipeline configuration
    pub augmentation: AugmentationConfig,
    /// Network and optimizer hyperparameters
    pub architecture: ArchitectureConfig,
    /// Two-phase schedule
    pub training: TrainingParams,
    /// Output artifact configuration
    pub output: OutputConfig,
}

impl PipelineConfig {
    /// Checks every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.data.validate()?;
        self.split.validate()?;
        self.augmentation.validate()?;
        self.architecture.validate()?;
        self.training.validate()?;
        Ok(())
    }
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root directory; each immediate subdirectory is a class
    pub data_dir: PathBuf,
    /// Allowed file extensions (case-insensitive)
    pub allowed_extensions: Vec<String>,
    /// Dimensions images are loaded at
    pub image_size: ImageDimensions,
    /// Resize decoded images to `image_size`; when false a size mismatch is an error
    pub resize: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            image_size: ImageDimensions::default(),
            resize: true,
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let dims = self.image_size;
        if dims.width == 0 || dims.height == 0 {
            return Err(ConfigurationError::Invalid(format!(
                "image size must be non-zero, got {dims}"
            )));
        }
        if dims.channels != 1 && dims.channels != 3 {
            return Err(ConfigurationError::Invalid(format!(
                "channel count must be 1 or 3, got {}",
                dims.channels
            )));
        }
        if self.allowed_extensions.is_empty() {
            return Err(ConfigurationError::Invalid(
                "at least one allowed extension is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Train/test percentages, applied to each class independently
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub train_percent: u32,
    pub test_percent: u32,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_percent: 80,
            test_percent: 20,
            seed: 42,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.train_percent == 0
            || self.test_percent == 0
            || self.train_percent + self.test_percent != 100
        {
            return Err(ConfigurationError::InvalidSplitRatio {
                train: self.train_percent,
                test: self.test_percent,
            });
        }
        Ok(())
    }
}

/// One stochastic image transform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformConfig {
    /// Horizontal, vertical or both, chosen per application
    Flip { seed: u64 },
    /// Perspective warp, every corner moved by up to `delta` pixels
    Warp { seed: u64, delta: f32 },
    /// Crop up to `max_fraction` off each border, then resize back
    Crop { seed: u64, max_fraction: f32 },
    /// Add a uniform brightness offset in `[-max_delta, max_delta]`
    Brightness { seed: u64, max_delta: i32 },
}

impl TransformConfig {
    fn validate(&self) -> Result<(), String> {
        match *self {
            TransformConfig::Flip { .. } => Ok(()),
            TransformConfig::Warp { delta, .. } if !delta.is_finite() => {
                Err(format!("warp delta must be finite, got {delta}"))
            }
            TransformConfig::Crop { max_fraction, .. }
                if !(max_fraction.is_finite() && (0.0..0.5).contains(&max_fraction)) =>
            {
                Err(format!("crop fraction must be in [0, 0.5), got {max_fraction}"))
            }
            TransformConfig::Brightness { max_delta, .. } if !(-255..=255).contains(&max_delta) => {
                Err(format!("brightness delta must be within 255, got {max_delta}"))
            }
            _ => Ok(()),
        }
    }
}

/// A transform and the probability it is applied to a given sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TransformEntryConfig {
    pub transform: TransformConfig,
    pub probability: f64,
}

/// Ordered augmentation pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Seed for the per-entry probability draws
    pub seed: u64,
    pub entries: Vec<TransformEntryConfig>,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            entries: vec![
                TransformEntryConfig {
                    transform: TransformConfig::Flip { seed: 42 },
                    probability: 0.8,
                },
                TransformEntryConfig {
                    transform: TransformConfig::Flip { seed: 123 },
                    probability: 0.7,
                },
                TransformEntryConfig {
                    transform: TransformConfig::Warp {
                        seed: 42,
                        delta: 42.0,
                    },
                    probability: 0.5,
                },
            ],
        }
    }
}

impl AugmentationConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (index, entry) in self.entries.iter().enumerate() {
            if !(0.0..=1.0).contains(&entry.probability) {
                return Err(ConfigurationError::InvalidProbability {
                    index,
                    probability: entry.probability,
                });
            }
            entry.transform.validate().map_err(|reason| {
                ConfigurationError::Invalid(format!("augmentation entry {index}: {reason}"))
            })?;
        }
        Ok(())
    }
}

/// Step decay on the iteration counter: `initial * decay^(iteration / step)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StepScheduleConfig {
    pub initial_rate: f64,
    pub decay_rate: f64,
    pub step: usize,
}

/// Gradient clipping applied uniformly to every parameter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GradientClipPolicy {
    None,
    Norm { threshold: f32 },
}

/// Network shape and optimizer hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectureConfig {
    pub conv1_filters: usize,
    pub conv2_filters: usize,
    pub dense_units: Vec<usize>,
    /// Std of the global N(0, std) weight initialisation
    pub weight_init_std: f64,
    /// Std override for dense layers
    pub dense_init_std: f64,
    pub weight_schedule: StepScheduleConfig,
    pub bias_schedule: StepScheduleConfig,
    pub momentum: f64,
    /// L2 penalty on weights (not biases)
    pub l2: f64,
    pub gradient_clip: GradientClipPolicy,
    /// Seed for weight initialisation
    pub init_seed: u64,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            conv1_filters: 96,
            conv2_filters: 256,
            dense_units: vec![500, 500],
            weight_init_std: 0.01,
            dense_init_std: 0.005,
            weight_schedule: StepScheduleConfig {
                initial_rate: 1e-2,
                decay_rate: 0.1,
                step: 100_000,
            },
            bias_schedule: StepScheduleConfig {
                initial_rate: 2e-2,
                decay_rate: 0.1,
                step: 100_000,
            },
            momentum: 0.9,
            l2: 5e-4,
            gradient_clip: GradientClipPolicy::Norm { threshold: 1.0 },
            init_seed: 42,
        }
    }
}

impl ArchitectureConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.conv1_filters == 0 || self.conv2_filters == 0 || self.dense_units.contains(&0) {
            return Err(ConfigurationError::InvalidArchitecture(
                "layer widths must be non-zero".to_string(),
            ));
        }
        for schedule in [&self.weight_schedule, &self.bias_schedule] {
            if schedule.initial_rate <= 0.0 || schedule.step == 0 {
                return Err(ConfigurationError::InvalidArchitecture(format!(
                    "learning-rate schedule needs a positive rate and step, got {schedule:?}"
                )));
            }
        }
        if self.weight_init_std <= 0.0 || self.dense_init_std <= 0.0 {
            return Err(ConfigurationError::InvalidArchitecture(
                "initialisation std must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the pixel scaler is fitted across the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationPolicy {
    /// Refit on the unaugmented train data, the augmented train data and the
    /// test data separately
    #[default]
    PerPhase,
    /// Fit once on the unaugmented train split and reuse everywhere
    FitOnce,
}

/// Two-phase training schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub batch_size: usize,
    pub warmup_passes: usize,
    pub augmented_passes: usize,
    /// Seed for the per-pass sample order
    pub shuffle_seed: u64,
    /// Emit an iteration score every this many iterations
    pub score_interval: usize,
    pub normalization: NormalizationPolicy,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            batch_size: 10,
            warmup_passes: 100,
            augmented_passes: 10,
            shuffle_seed: 42,
            score_interval: 100,
            normalization: NormalizationPolicy::PerPhase,
        }
    }
}

impl TrainingParams {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.batch_size == 0 {
            return Err(ConfigurationError::Invalid(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.score_interval == 0 {
            return Err(ConfigurationError::Invalid(
                "score interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Output artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub model_path: PathBuf,
    /// Replace an existing archive
    pub overwrite_existing: bool,
    /// Optional JSON evaluation report
    pub report_path: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("cnntrainedmodel.bin"),
            overwrite_existing: false,
            report_path: None,
        }
    }
}
