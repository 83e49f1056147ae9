//! Domain layer with core entities, errors and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;
/// Domain services.
pub mod services;

pub use entities::{CacheEntry, CacheKey, ImageSource, LoadPhase, LoadResult, LoadedImage};
pub use errors::{FetchError, LoadError, StorageError};
pub use ports::{FetchedImage, ImageFetcherPort};
pub use services::KeyResolver;
