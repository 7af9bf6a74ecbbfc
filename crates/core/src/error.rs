//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid page token: {0}")]
    InvalidPageToken(String),

    #[error("invalid object key: {0}")]
    InvalidObjectKey(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
