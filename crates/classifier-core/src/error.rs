//! Error types for the balanced image classifier pipeline.
//!
//! Every kind is a hard stop: nothing in the pipeline retries or skips a
//! sample after one of these is raised.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::{ImageDimensions, TrainingPhase};

/// Invalid or inconsistent configuration.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Path does not exist or is not a directory: {}", .0.display())]
    MissingPath(PathBuf),

    #[error("Invalid split ratio {train}/{test}: both must be positive and sum to 100")]
    InvalidSplitRatio { train: u32, test: u32 },

    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: ImageDimensions,
        actual: ImageDimensions,
    },

    #[error("Invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("Transform entry {index} has probability {probability}, expected a value in [0, 1]")]
    InvalidProbability { index: usize, probability: f64 },

    #[error("Failed to parse config {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Problems with the dataset itself or one of its images.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("No class subdirectories found under {}", .0.display())]
    EmptyDataset(PathBuf),

    #[error("Class '{class}' has no images with an allowed extension in {}", path.display())]
    NoSamples { class: String, path: PathBuf },

    #[error("Class '{class}' has {found} samples, at least {required} are needed for a train/test split")]
    InsufficientSamples {
        class: String,
        found: usize,
        required: usize,
    },

    #[error("Corrupt or undecodable image {}: {message}", path.display())]
    CorruptImage { path: PathBuf, message: String },

    #[error("Image {} has dimensions {actual}, expected {expected}", path.display())]
    DimensionMismatch {
        path: PathBuf,
        expected: ImageDimensions,
        actual: ImageDimensions,
    },

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DatasetError {
    /// The sample or directory the error refers to, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            DatasetError::EmptyDataset(path)
            | DatasetError::NoSamples { path, .. }
            | DatasetError::CorruptImage { path, .. }
            | DatasetError::DimensionMismatch { path, .. }
            | DatasetError::Io { path, .. } => Some(path),
            DatasetError::InsufficientSamples { .. } => None,
        }
    }
}

/// Failure inside one of the training phases.
#[derive(Error, Debug)]
pub enum TrainingPhaseError {
    #[error("Invalid trainer transition from {from} to {to}")]
    InvalidTransition {
        from: TrainingPhase,
        to: TrainingPhase,
    },

    #[error("{phase} failed on sample {}: {source}", path.display())]
    Sample {
        phase: TrainingPhase,
        path: PathBuf,
        #[source]
        source: DatasetError,
    },

    #[error("{phase} has no training samples bound")]
    EmptyTrainSet { phase: TrainingPhase },
}

/// Serialization or IO failure while persisting a model.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("IO error writing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed model archive {}: {message}", path.display())]
    Format { path: PathBuf, message: String },

    #[error("Parameter record error: {0}")]
    Record(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Main error type for the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    TrainingPhase(#[from] TrainingPhaseError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

/// Specialized Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
