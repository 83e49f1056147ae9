//! Image handling infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU or largest-first eviction
//! - Disk caching for persistence
//! - HTTP fetching and decoding
//! - Per-key fetch coordination

pub mod coordinator;
pub mod decoder;
pub mod disk_cache;
pub mod http_fetcher;
pub mod memory_cache;

pub use coordinator::{
    CoordinatorConfig, FetchCoordinator, RetryPolicy, Subscription, WeakFetchCoordinator,
};
pub use disk_cache::{DEFAULT_MAX_CACHE_SIZE, DiskImageCache, default_cache_dir};
pub use http_fetcher::{DEFAULT_USER_AGENT, HttpImageFetcher};
pub use memory_cache::{
    CacheStats, CachedImage, DEFAULT_MAX_MEMORY_BYTES, EvictionPolicy, MemoryImageCache,
};
