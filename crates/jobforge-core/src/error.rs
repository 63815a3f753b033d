//! Error types for jobforge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("none of the cache paths exist: {0:?}")]
    NoCacheableDirectories(Vec<String>),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(format!("serialization: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
