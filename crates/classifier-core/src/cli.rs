//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::ConfigurationError;

/// Installs the process-wide subscriber. `RUST_LOG` wins over `verbose`.
pub fn setup_cli_logging(verbose: bool) -> Result<(), ConfigurationError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init()
        .map_err(|e| ConfigurationError::Invalid(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T, ConfigurationError>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path).map_err(|e| ConfigurationError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    toml::from_str(&content).map_err(|e| ConfigurationError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
