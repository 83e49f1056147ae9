//! Observable state of an image load.

use crate::domain::errors::LoadError;

use super::LoadedImage;

/// Result delivered to every subscriber of a fetch.
pub type LoadResult = Result<LoadedImage, LoadError>;

/// Current phase of a session's load.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LoadPhase {
    /// No image is loaded.
    #[default]
    Empty,
    /// An image successfully loaded.
    Success(LoadedImage),
    /// An image failed to load with an error.
    Failure(LoadError),
}

impl LoadPhase {
    /// The loaded image, if any.
    #[must_use]
    pub const fn image(&self) -> Option<&LoadedImage> {
        match self {
            Self::Success(image) => Some(image),
            _ => None,
        }
    }

    /// The error that occurred when attempting to load an image, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&LoadError> {
        match self {
            Self::Failure(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true once the load has finished, either way.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Failure(_))
    }

    /// Returns true while nothing has been loaded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl From<LoadResult> for LoadPhase {
    fn from(result: LoadResult) -> Self {
        match result {
            Ok(image) => Self::Success(image),
            Err(err) => Self::Failure(err),
        }
    }
}

impl std::fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Success(image) => write!(
                f,
                "success ({}x{} from {})",
                image.width(),
                image.height(),
                image.source
            ),
            Self::Failure(err) => write!(f, "failure ({err})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        let phase = LoadPhase::default();
        assert!(phase.is_empty());
        assert!(!phase.is_terminal());
        assert!(phase.image().is_none());
        assert!(phase.error().is_none());
    }

    #[test]
    fn test_failure_accessors() {
        let phase: LoadPhase = Err(LoadError::network("boom")).into();
        assert!(phase.is_terminal());
        assert_eq!(phase.error(), Some(&LoadError::network("boom")));
        assert_eq!(phase.to_string(), "failure (network error: boom)");
    }
}
