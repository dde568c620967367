//! Error types for Ringrate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ringrate operations.
#[derive(Error, Debug)]
pub enum RingrateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store batch failed and nothing was applied
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ringrate operations.
pub type Result<T> = std::result::Result<T, RingrateError>;
