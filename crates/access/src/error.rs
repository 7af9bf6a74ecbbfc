//! Access and capability error types.

use thiserror::Error;

/// Errors from grant parsing and capability operations.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("invalid access grant: {0}")]
    InvalidGrant(String),

    #[error("no key for path '{0}'")]
    PathNotCovered(String),

    #[error("decryption failed")]
    Decrypt,

    #[error("cannot find decryption key")]
    NoCapability,

    #[error("invalid metadata: {0}")]
    Metadata(String),
}

impl From<keyhole_core::Error> for AccessError {
    fn from(err: keyhole_core::Error) -> Self {
        AccessError::Metadata(err.to_string())
    }
}

/// Result type for access operations.
pub type AccessResult<T> = std::result::Result<T, AccessError>;
