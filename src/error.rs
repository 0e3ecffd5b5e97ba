//! Error types for docqueue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected before any store interaction. No side effects.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// The store refused an operation (duplicate key, index conflict, ...).
    #[error("store rejected operation: {0}")]
    Rejected(String),

    #[error("malformed document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
