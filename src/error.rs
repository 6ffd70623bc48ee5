//! Error types for the Vigil service.

use thiserror::Error;

/// Main error type for Vigil operations.
#[derive(Error, Debug)]
pub enum VigilError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Faults inside the admission bookkeeping (never a plain denial)
    #[error("Admission error: {0}")]
    Admission(String),

    /// Layered configuration loading errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Vigil operations.
pub type Result<T> = std::result::Result<T, VigilError>;
