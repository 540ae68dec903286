use std::path::{Path, PathBuf};

use crate::cache::CacheError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Cache file not found at the specified path.
    #[error("cache not found: {0}")]
    MissingCache(PathBuf),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Cache store error.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_cache(path: impl AsRef<Path>) -> Self {
        AdminError::MissingCache(path.as_ref().to_path_buf())
    }
}
