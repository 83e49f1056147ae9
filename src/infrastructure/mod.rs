//! Infrastructure layer with external service adapters.

/// Application configuration.
pub mod config;
/// Image handling (caching, fetching, decoding, coordination).
pub mod image;

pub use config::{AppConfig, CliArgs, Command, ConfigStore, LogLevel};
pub use image::{
    CacheStats, CoordinatorConfig, DiskImageCache, FetchCoordinator, HttpImageFetcher,
    MemoryImageCache,
};
