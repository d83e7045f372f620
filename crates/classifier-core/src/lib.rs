//! Core types and utilities for the balanced image classifier pipeline.
//!
//! This crate provides the error taxonomy, configuration structures,
//! evaluation metrics and CLI helpers shared by the dataset and training
//! crates.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use cli::*;
pub use config::*;
pub use error::{
    ConfigurationError, DatasetError, Error, PersistenceError, Result, TrainingPhaseError,
};
pub use metrics::*;
pub use types::*;
