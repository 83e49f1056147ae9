//! Errors surfaced to the presentation layer through a failed phase.

use thiserror::Error;

use super::FetchError;

/// Terminal load failure.
///
/// Cloneable so one failed fetch can be delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum LoadError {
    #[error("no url or identifier to load")]
    InvalidKey,

    #[error("nothing cached for this identifier and no url to fetch it from")]
    MissingUrl,

    #[error("network error: {message}")]
    Network { message: String },

    #[error("failed to decode image: {message}")]
    Decode { message: String },

    #[error("image load was cancelled")]
    Cancelled,

    #[error("image service is no longer available")]
    ServiceUnavailable,
}

impl LoadError {
    /// Creates network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Returns true for failures a manual reload may fix.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Cancelled)
    }
}

impl From<FetchError> for LoadError {
    fn from(err: FetchError) -> Self {
        Self::network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fetch_error_maps_to_network() {
        let err: LoadError = FetchError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(err, LoadError::Network { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_decode_is_not_transient() {
        assert!(!LoadError::decode("bad header").is_transient());
        assert!(!LoadError::InvalidKey.is_transient());
    }
}
