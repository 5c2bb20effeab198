//! Error types for pscore

use thiserror::Error;

/// pscore error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed input file (bad CSV record, unreadable header, ...)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Validation error (missing column, non-binary treatment, bad config, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error (singular matrix, perfect separation, zero variance, ...)
    #[error("Computation error: {0}")]
    Computation(String),

    /// An iterative fit stopped without converging
    #[error("Convergence error: {0}")]
    Convergence(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
