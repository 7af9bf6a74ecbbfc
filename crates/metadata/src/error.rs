//! Repository error types.

use thiserror::Error;

/// Metadata repository operation errors.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("object not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for repository operations.
pub type RepoResult<T> = std::result::Result<T, RepoError>;
