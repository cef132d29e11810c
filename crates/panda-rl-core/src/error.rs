//! Error types for the RL core library

use thiserror::Error;

/// Core error type for RL operations
#[derive(Error, Debug)]
pub enum RLError {
    /// Environment-related errors
    #[error("Environment error: {0}")]
    Environment(String),

    /// No environment is registered under the requested id
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    /// Invalid action
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Invalid algorithm or environment configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing, corrupt or incompatible checkpoint
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Failure while tracing or writing an exported graph
    #[error("Export error: {0}")]
    Export(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for RL operations
pub type Result<T> = std::result::Result<T, RLError>;
