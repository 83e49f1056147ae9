//! Disk cache error types.

use thiserror::Error;

/// Disk cache failure. Never surfaced to sessions.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum StorageError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache entry: {reason}")]
    Corrupt { reason: String },

    #[error("failed to encode cache header: {0}")]
    Header(#[from] serde_json::Error),
}

impl StorageError {
    /// Creates corrupt entry error.
    #[must_use]
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }
}

/// Result type for disk cache operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
