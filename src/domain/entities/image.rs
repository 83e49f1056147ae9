//! Domain types for decoded images.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::CacheKey;

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Loaded from in-memory LRU cache.
    MemoryCache,
    /// Loaded from disk cache.
    DiskCache,
    /// Downloaded from network.
    Network,
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// A decoded image ready for display.
#[derive(Clone)]
pub struct LoadedImage {
    /// Key the image is cached under.
    pub key: CacheKey,
    /// Decoded pixels, shared with the memory cache.
    pub image: Arc<image::DynamicImage>,
    /// Content type reported when the image was fetched.
    pub content_type: Option<String>,
    /// When the payload was fetched from the network.
    pub fetched_at: DateTime<Utc>,
    /// Which tier served this load.
    pub source: ImageSource,
}

impl LoadedImage {
    /// Pixel width.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Pixel height.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl fmt::Debug for LoadedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedImage")
            .field("key", &self.key)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("content_type", &self.content_type)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl PartialEq for LoadedImage {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.fetched_at == other.fetched_at
            && Arc::ptr_eq(&self.image, &other.image)
    }
}
