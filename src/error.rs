//! Error types for Fairgate.

use std::time::Duration;

use thiserror::Error;

use crate::limits::ValidationError;
use crate::store::StoreError;

/// Main error type for Fairgate operations.
#[derive(Error, Debug)]
pub enum FairgateError {
    /// A limit configuration update violated an invariant; nothing was published.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The backing store could not be reached or refused the operation.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The backing store did not answer within the operation timeout.
    #[error("Store timed out after {0:?}")]
    StoreTimeout(Duration),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization of a persisted document failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for FairgateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => FairgateError::StoreUnavailable(reason),
        }
    }
}

impl From<config::ConfigError> for FairgateError {
    fn from(err: config::ConfigError) -> Self {
        FairgateError::Config(err.to_string())
    }
}

impl FairgateError {
    /// Whether this error came from the backing store rather than the caller.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            FairgateError::StoreUnavailable(_) | FairgateError::StoreTimeout(_)
        )
    }
}

/// Result type alias for Fairgate operations.
pub type Result<T> = std::result::Result<T, FairgateError>;
