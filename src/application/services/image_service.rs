//! Consumer facade wiring cache tiers, fetcher and coordinator.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::domain::errors::{FetchError, LoadError, StorageError};
use crate::domain::ports::ImageFetcherPort;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::image::{
    CacheStats, CoordinatorConfig, DiskImageCache, FetchCoordinator, HttpImageFetcher,
    MemoryImageCache,
};

use super::image_session::ImageLoadSession;

/// Handle returned to the presentation layer for one image view.
pub type SessionHandle = ImageLoadSession;

/// Failure while building the service.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ServiceError {
    #[error("failed to open disk cache: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to create network client: {0}")]
    Fetch(#[from] FetchError),
}

/// Snapshot of both cache tiers.
#[derive(Debug, Clone)]
pub struct ServiceStats {
    /// Memory tier counters.
    pub memory: CacheStats,
    /// Bytes on disk.
    pub disk_bytes: u64,
    /// Entries on disk.
    pub disk_entries: usize,
    /// Network fetch attempts since start.
    pub network_fetches: u64,
    /// Keys with a fetch in flight.
    pub in_flight: usize,
}

impl fmt::Display for ServiceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.memory)?;
        writeln!(
            f,
            "Disk: {} entries, {} bytes",
            self.disk_entries, self.disk_bytes
        )?;
        write!(
            f,
            "Network: {} fetches, {} in flight",
            self.network_fetches, self.in_flight
        )
    }
}

/// Owns the fetch coordinator; sessions hold only a weak reference to it.
pub struct ImageService {
    coordinator: FetchCoordinator,
}

impl ImageService {
    /// Builds the service from configuration.
    ///
    /// # Errors
    /// Returns error if the disk cache directory cannot be opened or the HTTP
    /// client cannot be created.
    pub async fn new(config: &AppConfig) -> Result<Self, ServiceError> {
        let memory = Arc::new(MemoryImageCache::new(
            config.cache.max_memory_bytes,
            config.cache.eviction_policy,
        ));
        let disk = Arc::new(
            DiskImageCache::new(
                config.cache.effective_disk_location(),
                config.cache.max_disk_bytes,
                config.cache.max_entry_age(),
            )
            .await?,
        );
        let fetcher = Arc::new(HttpImageFetcher::new(&config.network.user_agent)?);

        info!(
            disk = %disk.dir().display(),
            memory_budget = config.cache.max_memory_bytes,
            disk_budget = config.cache.max_disk_bytes,
            "Image service ready"
        );

        Ok(Self::with_parts(
            memory,
            disk,
            fetcher,
            config.coordinator_config(),
        ))
    }

    /// Builds the service from explicit parts.
    #[must_use]
    pub fn with_parts(
        memory: Arc<MemoryImageCache>,
        disk: Arc<DiskImageCache>,
        fetcher: Arc<dyn ImageFetcherPort>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            coordinator: FetchCoordinator::new(memory, disk, fetcher, config),
        }
    }

    /// Creates a session and binds it.
    ///
    /// # Errors
    /// Returns [`LoadError::InvalidKey`] when neither input yields a key.
    pub fn create_session(
        &self,
        url: Option<Url>,
        identifier: Option<&str>,
    ) -> Result<SessionHandle, LoadError> {
        let session = ImageLoadSession::new(&self.coordinator);
        session.bind(url, identifier)?;
        Ok(session)
    }

    /// Creates an unbound session.
    #[must_use]
    pub fn unbound_session(&self) -> SessionHandle {
        ImageLoadSession::new(&self.coordinator)
    }

    /// Removes expired entries from disk.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be listed.
    pub async fn purge_expired(&self) -> Result<usize, StorageError> {
        let removed = self.coordinator.disk_cache().purge_expired().await?;
        info!(removed, "Purged expired disk entries");
        Ok(removed)
    }

    /// Empties both cache tiers.
    pub async fn clear(&self) {
        self.coordinator.clear().await;
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        let disk = self.coordinator.disk_cache();
        ServiceStats {
            memory: self.coordinator.memory_cache().stats(),
            disk_bytes: disk.current_size(),
            disk_entries: disk.len(),
            network_fetches: self.coordinator.network_fetch_count(),
            in_flight: self.coordinator.in_flight_count(),
        }
    }

    /// Underlying coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }
}

impl fmt::Debug for ImageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageService")
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
