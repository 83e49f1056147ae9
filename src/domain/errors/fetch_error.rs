//! Errors reported by the network collaborator.

use std::time::Duration;

use thiserror::Error;

/// Network fetch failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {reason}")]
    Status {
        /// Status code.
        status: u16,
        /// Canonical reason phrase.
        reason: String,
    },

    /// Connection, TLS or body transfer failure.
    #[error("request failed: {0}")]
    Transport(String),

    /// The deadline elapsed before the body was received.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Returns true if repeating the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidRequest(_) => false,
        }
    }
}
