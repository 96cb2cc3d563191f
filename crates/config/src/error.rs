//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("failed to read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration is not valid TOML or does not match the schema
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field failed validation
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// Fields are individually valid but inconsistent with each other
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
