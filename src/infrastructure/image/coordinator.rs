//! Fetch coordination: cache tiers plus per-key request deduplication.
//!
//! Lookup order is memory, then disk, then network. At most one network fetch
//! per key is in flight; later requesters attach to it and receive the same
//! result. A fetch whose subscribers all withdraw before it completes is
//! aborted and writes nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::domain::entities::{CacheEntry, CacheKey, ImageSource, LoadResult, LoadedImage};
use crate::domain::errors::{FetchError, LoadError};
use crate::domain::ports::{FetchedImage, ImageFetcherPort};

use super::decoder;
use super::disk_cache::DiskImageCache;
use super::memory_cache::{CachedImage, MemoryImageCache};

/// Retry behaviour for failed network fetches.
///
/// The default makes a single attempt; repeating a load is then up to the
/// caller (a manual reload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before each repeated attempt.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline handed to every network fetch.
    pub fetch_timeout: Duration,
    /// Entries older than this are treated as absent. `None` disables aging.
    pub max_entry_age: Option<Duration>,
    /// Maximum concurrent network fetches across all keys.
    pub max_concurrent_fetches: usize,
    /// Downscale decoded images larger than this in either dimension.
    pub max_decoded_dimension: Option<u32>,
    /// Retry behaviour.
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_entry_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            max_concurrent_fetches: 4,
            max_decoded_dimension: None,
            retry: RetryPolicy::none(),
        }
    }
}

/// A network fetch shared by every concurrent requester of one key.
struct InFlightFetch {
    id: u64,
    subscribers: usize,
    /// Set once the result exists; from then on the fetch can no longer be cancelled.
    committing: bool,
    abort: Option<AbortHandle>,
    result_rx: watch::Receiver<Option<LoadResult>>,
}

struct Inner {
    memory: Arc<MemoryImageCache>,
    disk: Arc<DiskImageCache>,
    fetcher: Arc<dyn ImageFetcherPort>,
    in_flight: Mutex<HashMap<CacheKey, InFlightFetch>>,
    permits: Arc<Semaphore>,
    next_flight_id: AtomicU64,
    network_fetches: AtomicU64,
    config: CoordinatorConfig,
}

/// Shared entry point for image requests.
///
/// Cloning is cheap; all clones share caches and the in-flight table.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`FetchCoordinator`].
#[derive(Clone, Default)]
pub struct WeakFetchCoordinator {
    inner: Weak<Inner>,
}

impl WeakFetchCoordinator {
    /// Returns the coordinator if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<FetchCoordinator> {
        self.inner.upgrade().map(|inner| FetchCoordinator { inner })
    }
}

impl fmt::Debug for WeakFetchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakFetchCoordinator")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("config", &self.inner.config)
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

impl FetchCoordinator {
    /// Creates a coordinator over the given caches and network collaborator.
    #[must_use]
    pub fn new(
        memory: Arc<MemoryImageCache>,
        disk: Arc<DiskImageCache>,
        fetcher: Arc<dyn ImageFetcherPort>,
        config: CoordinatorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1)));
        Self {
            inner: Arc::new(Inner {
                memory,
                disk,
                fetcher,
                in_flight: Mutex::new(HashMap::new()),
                permits,
                next_flight_id: AtomicU64::new(1),
                network_fetches: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Returns a non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakFetchCoordinator {
        WeakFetchCoordinator {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Requests the image for `key`, fetching `url` if no tier has it.
    ///
    /// Cache hits resolve immediately. Otherwise the returned subscription
    /// waits on the single in-flight fetch for `key`. Dropping the
    /// subscription before it resolves withdraws from that fetch.
    pub async fn request(&self, key: CacheKey, url: Url) -> Subscription {
        if let Some(image) = self.inner.fresh_from_memory(&key) {
            return Subscription::ready(key, Ok(image));
        }

        if let Some(image) = self.inner.load_from_disk(&key).await {
            return Subscription::ready(key, Ok(image));
        }

        self.inner.attach_or_start(key, url)
    }

    /// Looks `key` up in the cache tiers without touching the network.
    pub async fn lookup(&self, key: &CacheKey) -> Option<LoadedImage> {
        if let Some(image) = self.inner.fresh_from_memory(key) {
            return Some(image);
        }
        self.inner.load_from_disk(key).await
    }

    /// Number of keys with a fetch in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Number of subscribers attached to the fetch for `key`, if one is in flight.
    #[must_use]
    pub fn subscriber_count(&self, key: &CacheKey) -> Option<usize> {
        self.inner.in_flight.lock().get(key).map(|f| f.subscribers)
    }

    /// Total network fetch attempts started since creation.
    #[must_use]
    pub fn network_fetch_count(&self) -> u64 {
        self.inner.network_fetches.load(Ordering::Relaxed)
    }

    /// Memory tier.
    #[must_use]
    pub fn memory_cache(&self) -> &Arc<MemoryImageCache> {
        &self.inner.memory
    }

    /// Disk tier.
    #[must_use]
    pub fn disk_cache(&self) -> &Arc<DiskImageCache> {
        &self.inner.disk
    }

    /// Clears both cache tiers. In-flight fetches are left alone.
    pub async fn clear(&self) {
        self.inner.memory.clear();
        if let Err(e) = self.inner.disk.clear().await {
            warn!(error = %e, "Failed to clear disk cache");
        }
        info!("Cleared all image caches");
    }
}

impl Inner {
    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        !entry.is_expired(self.config.max_entry_age)
    }

    fn fresh_from_memory(&self, key: &CacheKey) -> Option<LoadedImage> {
        let cached = self.memory.get(key)?;
        if !self.is_fresh(&cached.entry) {
            debug!(key = %key, "Memory cache entry expired");
            self.memory.remove(key);
            return None;
        }
        Some(loaded(&cached, ImageSource::MemoryCache))
    }

    async fn load_from_disk(&self, key: &CacheKey) -> Option<LoadedImage> {
        let entry = self.disk.read(key).await?;

        match decoder::decode(entry.bytes().clone(), self.config.max_decoded_dimension).await {
            Ok(img) => {
                let cached = CachedImage {
                    entry,
                    image: Arc::new(img),
                };
                self.memory.put(cached.clone());
                debug!(key = %key, source = "disk", "Promoted image to memory cache");
                Some(loaded(&cached, ImageSource::DiskCache))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cached payload no longer decodes, dropping it");
                self.disk.delete(key).await;
                None
            }
        }
    }

    fn attach_or_start(self: &Arc<Self>, key: CacheKey, url: Url) -> Subscription {
        let mut table = self.in_flight.lock();

        if let Some(flight) = table.get_mut(&key) {
            flight.subscribers += 1;
            trace!(key = %key, subscribers = flight.subscribers, "Attached to in-flight fetch");
            return Subscription::waiting(key, flight.id, flight.result_rx.clone(), self.clone());
        }

        // A fetch may have committed between the lock-free lookups above and
        // taking the table lock; it writes memory before leaving the table.
        if let Some(image) = self.fresh_from_memory(&key) {
            return Subscription::ready(key, Ok(image));
        }

        let id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
        let (result_tx, result_rx) = watch::channel(None);
        let task = tokio::spawn(run_fetch(
            self.clone(),
            key.clone(),
            url,
            id,
            result_tx,
        ));

        table.insert(
            key.clone(),
            InFlightFetch {
                id,
                subscribers: 1,
                committing: false,
                abort: Some(task.abort_handle()),
                result_rx: result_rx.clone(),
            },
        );
        debug!(key = %key, flight = id, "Started network fetch");

        Subscription::waiting(key, id, result_rx, self.clone())
    }

    /// Withdraws one subscriber. The last one out before commit aborts the fetch.
    fn detach(&self, key: &CacheKey, flight_id: u64) {
        let mut table = self.in_flight.lock();
        let Some(flight) = table.get_mut(key).filter(|f| f.id == flight_id) else {
            return;
        };

        flight.subscribers = flight.subscribers.saturating_sub(1);
        trace!(key = %key, subscribers = flight.subscribers, "Subscriber withdrew");
        if flight.subscribers > 0 || flight.committing {
            return;
        }

        if let Some(flight) = table.remove(key) {
            if let Some(abort) = flight.abort {
                abort.abort();
            }
            debug!(key = %key, flight = flight_id, "Cancelled abandoned fetch");
        }
    }

    /// Marks the flight as committing. Returns false if it was cancelled.
    fn begin_commit(&self, key: &CacheKey, flight_id: u64) -> bool {
        let mut table = self.in_flight.lock();
        match table.get_mut(key) {
            Some(flight) if flight.id == flight_id => {
                flight.committing = true;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, key: &CacheKey, flight_id: u64) {
        let mut table = self.in_flight.lock();
        if table.get(key).is_some_and(|f| f.id == flight_id) {
            table.remove(key);
        }
    }

    async fn fetch_with_retry(&self, key: &CacheKey, url: &Url) -> Result<FetchedImage, FetchError> {
        let _permit = self.permits.acquire().await;
        let attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.network_fetches.fetch_add(1, Ordering::Relaxed);
            let result = self.fetcher.fetch(url, self.config.fetch_timeout).await;
            match result {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(key = %key, attempt = attempt, error = %e, "Fetch failed, retrying");
                    tokio::time::sleep(self.config.retry.backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn fetch_and_decode(&self, key: &CacheKey, url: &Url) -> Result<CachedImage, LoadError> {
        let fetched = match tokio::time::timeout(
            // Permit wait plus all attempts stay bounded.
            self.overall_deadline(),
            self.fetch_with_retry(key, url),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(FetchError::Timeout(self.overall_deadline()).into()),
        };

        let img = decoder::decode(fetched.bytes.clone(), self.config.max_decoded_dimension).await?;

        let fetched_at = Utc::now();
        let expires_at = fetched
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| fetched_at + age);
        let entry = CacheEntry::new(key.clone(), fetched.bytes)
            .with_url(url.as_str())
            .with_content_type(fetched.content_type)
            .with_fetched_at(fetched_at)
            .with_expires_at(expires_at);

        Ok(CachedImage {
            entry,
            image: Arc::new(img),
        })
    }

    fn overall_deadline(&self) -> Duration {
        let retry = self.config.retry;
        let attempts = retry.max_attempts.max(1);
        (self.config.fetch_timeout + retry.backoff) * attempts + self.config.fetch_timeout
    }
}

fn loaded(cached: &CachedImage, source: ImageSource) -> LoadedImage {
    LoadedImage {
        key: cached.entry.key().clone(),
        image: cached.image.clone(),
        content_type: cached.entry.content_type().map(String::from),
        fetched_at: cached.entry.fetched_at(),
        source,
    }
}

/// Removes the flight if the task ends without finishing (panic or abort).
struct FlightGuard {
    inner: Arc<Inner>,
    key: CacheKey,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.finish(&self.key, self.id);
    }
}

async fn run_fetch(
    inner: Arc<Inner>,
    key: CacheKey,
    url: Url,
    id: u64,
    result_tx: watch::Sender<Option<LoadResult>>,
) {
    let guard = FlightGuard {
        inner: inner.clone(),
        key: key.clone(),
        id,
    };

    let outcome = inner.fetch_and_decode(&key, &url).await;

    if !inner.begin_commit(&key, id) {
        debug!(key = %key, flight = id, "Fetch finished after cancellation, discarding");
        return;
    }

    let result = match outcome {
        Ok(cached) => {
            let image = loaded(&cached, ImageSource::Network);
            if !inner.is_fresh(&cached.entry) {
                // Already stale (e.g. `no-store`): serve it once, cache nothing.
                debug!(key = %key, "Fetched image is not cacheable");
            } else {
                inner.memory.put(cached.clone());
                if let Err(e) = inner.disk.write(&cached.entry).await {
                    warn!(key = %key, error = %e, "Failed to cache to disk");
                }
            }
            debug!(key = %key, source = "network", "Image loaded successfully");
            Ok(image)
        }
        Err(e) => {
            debug!(key = %key, error = %e, "Image fetch failed");
            Err(e)
        }
    };

    // Leave the table before publishing so a request arriving after delivery
    // starts over instead of attaching to a finished fetch.
    drop(guard);
    result_tx.send_replace(Some(result));
}

enum SubscriptionState {
    Ready(LoadResult),
    Waiting {
        flight_id: u64,
        result_rx: watch::Receiver<Option<LoadResult>>,
        inner: Arc<Inner>,
    },
    Finished,
}

/// A pending or resolved request for one key.
#[must_use = "dropping a subscription cancels its interest in the fetch"]
pub struct Subscription {
    key: CacheKey,
    state: SubscriptionState,
}

impl Subscription {
    fn ready(key: CacheKey, result: LoadResult) -> Self {
        Self {
            key,
            state: SubscriptionState::Ready(result),
        }
    }

    fn waiting(
        key: CacheKey,
        flight_id: u64,
        result_rx: watch::Receiver<Option<LoadResult>>,
        inner: Arc<Inner>,
    ) -> Self {
        Self {
            key,
            state: SubscriptionState::Waiting {
                flight_id,
                result_rx,
                inner,
            },
        }
    }

    /// Key this subscription is for.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Returns true if the result is available without waiting.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.state, SubscriptionState::Ready(_))
    }

    /// Waits for the result.
    ///
    /// Dropping this future before it completes withdraws the subscription.
    pub async fn wait(mut self) -> LoadResult {
        match &mut self.state {
            SubscriptionState::Ready(_) => {
                match std::mem::replace(&mut self.state, SubscriptionState::Finished) {
                    SubscriptionState::Ready(result) => result,
                    _ => Err(LoadError::Cancelled),
                }
            }
            SubscriptionState::Waiting { result_rx, .. } => {
                let result = match result_rx.wait_for(Option::is_some).await {
                    Ok(value) => value.clone().unwrap_or(Err(LoadError::Cancelled)),
                    Err(_) => Err(LoadError::Cancelled),
                };
                self.state = SubscriptionState::Finished;
                result
            }
            SubscriptionState::Finished => Err(LoadError::Cancelled),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let SubscriptionState::Waiting {
            flight_id, inner, ..
        } = &self.state
        {
            inner.detach(&self.key, *flight_id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            SubscriptionState::Ready(_) => "ready",
            SubscriptionState::Waiting { .. } => "waiting",
            SubscriptionState::Finished => "finished",
        };
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::MockImageFetcherPort;
    use crate::domain::ports::mocks::StubFetcher;
    use crate::infrastructure::image::decoder::sample_png;
    use crate::infrastructure::image::memory_cache::EvictionPolicy;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    const URL_A: &str = "https://img.example.com/a.png";
    const URL_B: &str = "https://img.example.com/b.png";

    struct Harness {
        coordinator: FetchCoordinator,
        fetcher: Arc<StubFetcher>,
        _temp: TempDir,
    }

    async fn harness(fetcher: StubFetcher) -> Harness {
        harness_with(fetcher, CoordinatorConfig::default()).await
    }

    async fn harness_with(fetcher: StubFetcher, config: CoordinatorConfig) -> Harness {
        let temp = TempDir::new().unwrap();
        let disk = Arc::new(
            DiskImageCache::new(temp.path().to_path_buf(), 16 * 1024 * 1024, config.max_entry_age)
                .await
                .unwrap(),
        );
        let memory = Arc::new(MemoryImageCache::new(
            16 * 1024 * 1024,
            EvictionPolicy::LeastRecentlyUsed,
        ));
        let fetcher = Arc::new(fetcher);
        let coordinator = FetchCoordinator::new(memory, disk, fetcher.clone(), config);
        Harness {
            coordinator,
            fetcher,
            _temp: temp,
        }
    }

    fn png(width: u32, height: u32) -> Result<FetchedImage, FetchError> {
        Ok(FetchedImage::new(sample_png(width, height)).with_content_type("image/png"))
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from_identifier(name)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_network_result_populates_both_tiers() {
        let fetcher = StubFetcher::new();
        fetcher.respond(URL_A, png(3, 2));
        let h = harness(fetcher).await;

        let image = h.coordinator.request(key("A"), url(URL_A)).await.wait().await.unwrap();
        assert_eq!(image.source, ImageSource::Network);
        assert_eq!((image.width(), image.height()), (3, 2));

        let expected = sample_png(3, 2);
        let in_memory = h.coordinator.memory_cache().get(&key("A")).unwrap();
        assert_eq!(in_memory.entry.bytes().as_ref(), expected.as_slice());
        let on_disk = h.coordinator.disk_cache().read(&key("A")).await.unwrap();
        assert_eq!(on_disk.bytes().as_ref(), expected.as_slice());
        assert_eq!(on_disk.url(), Some(URL_A));
        assert_eq!(on_disk.content_type(), Some("image/png"));
        assert_eq!(h.coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_cached_key_never_hits_network() {
        let mut mock = MockImageFetcherPort::new();
        mock.expect_fetch()
            .times(1)
            .returning(|_, _| Ok(FetchedImage::new(sample_png(2, 2))));

        let temp = TempDir::new().unwrap();
        let disk = Arc::new(
            DiskImageCache::new(temp.path().to_path_buf(), 1024 * 1024, None)
                .await
                .unwrap(),
        );
        let memory = Arc::new(MemoryImageCache::with_default_capacity());
        let coordinator =
            FetchCoordinator::new(memory, disk, Arc::new(mock), CoordinatorConfig::default());

        let first = coordinator.request(key("A"), url(URL_A)).await.wait().await.unwrap();
        assert_eq!(first.source, ImageSource::Network);

        for _ in 0..3 {
            let again = coordinator.request(key("A"), url(URL_A)).await;
            assert!(again.is_ready());
            assert_eq!(again.wait().await.unwrap().source, ImageSource::MemoryCache);
        }
        assert_eq!(coordinator.network_fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_disk_hit_is_promoted_to_memory() {
        let h = harness(StubFetcher::new()).await;
        let entry = CacheEntry::new(key("A"), sample_png(5, 5)).with_url(URL_A);
        h.coordinator.disk_cache().write(&entry).await.unwrap();

        let image = h.coordinator.request(key("A"), url(URL_A)).await.wait().await.unwrap();
        assert_eq!(image.source, ImageSource::DiskCache);
        assert!(h.coordinator.memory_cache().peek(&key("A")).is_some());
        assert_eq!(h.fetcher.calls(), 0);

        let image = h.coordinator.request(key("A"), url(URL_A)).await.wait().await.unwrap();
        assert_eq!(image.source, ImageSource::MemoryCache);
    }

    #[tokio::test]
    async fn test_expired_disk_entry_triggers_fresh_fetch() {
        let fetcher = StubFetcher::new();
        fetcher.respond(URL_A, png(4, 4));
        let config = CoordinatorConfig {
            max_entry_age: Some(Duration::from_secs(60)),
            ..CoordinatorConfig::default()
        };
        let h = harness_with(fetcher, config).await;

        let stale = CacheEntry::new(key("A"), sample_png(1, 1))
            .with_fetched_at(Utc::now() - TimeDelta::minutes(5));
        h.coordinator.disk_cache().write(&stale).await.unwrap();

        let image = h.coordinator.request(key("A"), url(URL_A)).await.wait().await.unwrap();
        assert_eq!(image.source, ImageSource::Network);
        assert_eq!(image.width(), 4);
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_memory_entry_is_refetched() {
        let fetcher = StubFetcher::new();
        fetcher.respond(URL_A, png(2, 2));
        let config = CoordinatorConfig {
            max_entry_age: Some(Duration::from_secs(60)),
            ..CoordinatorConfig::default()
        };
        let h = harness_with(fetcher, config).await;

        h.coordinator.memory_cache().put(CachedImage {
            entry: CacheEntry::new(key("A"), sample_png(1, 1))
                .with_fetched_at(Utc::now() - TimeDelta::hours(1)),
            image: Arc::new(image::DynamicImage::new_rgb8(1, 1)),
        });

        let image = h.coordinator.request(key("A"), url(URL_A)).await.wait().await.unwrap();
        assert_eq!(image.source, ImageSource::Network);
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_lookup_reads_tiers_without_network() {
        let h = harness(StubFetcher::new()).await;
        assert!(h.coordinator.lookup(&key("A")).await.is_none());

        let entry = CacheEntry::new(key("A"), sample_png(2, 2));
        h.coordinator.disk_cache().write(&entry).await.unwrap();

        let image = h.coordinator.lookup(&key("A")).await.unwrap();
        assert_eq!(image.source, ImageSource::DiskCache);
        let image = h.coordinator.lookup(&key("A")).await.unwrap();
        assert_eq!(image.source, ImageSource::MemoryCache);
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_request_storm_makes_one_network_call() {
        let fetcher = StubFetcher::gated();
        fetcher.respond(URL_A, png(2, 2));
        let h = harness(fetcher).await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let coordinator = h.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.request(key("A"), url(URL_A)).await.wait().await
            }));
        }

        let coordinator = h.coordinator.clone();
        eventually(move || coordinator.subscriber_count(&key("A")) == Some(32)).await;
        assert_eq!(h.coordinator.in_flight_count(), 1);
        h.fetcher.release();

        let mut fetched_at = None;
        for handle in handles {
            let image = handle.await.unwrap().unwrap();
            assert_eq!(image.source, ImageSource::Network);
            // Everyone sees the same commit.
            assert_eq!(*fetched_at.get_or_insert(image.fetched_at), image.fetched_at);
        }
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.fetcher.max_active_per_url(), 1);
        assert_eq!(h.coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_subscriber_and_caches_nothing() {
        let fetcher = StubFetcher::gated();
        fetcher.respond(
            URL_A,
            Err(FetchError::Status {
                status: 500,
                reason: "Internal Server Error".to_string(),
            }),
        );
        let h = harness(fetcher).await;

        let first = h.coordinator.request(key("A"), url(URL_A)).await;
        let second = h.coordinator.request(key("A"), url(URL_A)).await;
        assert_eq!(h.coordinator.subscriber_count(&key("A")), Some(2));
        h.fetcher.release();

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert!(matches!(a, Err(LoadError::Network { .. })));
        assert_eq!(a, b);
        assert_eq!(h.fetcher.calls(), 1);
        assert!(h.coordinator.memory_cache().is_empty());
        assert!(!h.coordinator.disk_cache().contains(&key("A")).await);
    }

    #[tokio::test]
    async fn test_failure_is_not_retried_by_default() {
        let fetcher = StubFetcher::new();
        fetcher.respond(URL_A, Err(FetchError::Transport("reset".to_string())));
        let h = harness(fetcher).await;

        let result = h.coordinator.request(key("A"), url(URL_A)).await.wait().await;
        assert!(result.is_err());
        assert_eq!(h.fetcher.calls(), 1);

        // A manual reload issues a new fetch.
        let _ = h.coordinator.request(key("A"), url(URL_A)).await.wait().await;
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_configured_retry_repeats_transient_failures() {
        let fetcher = StubFetcher::new();
        fetcher.respond(URL_A, Err(FetchError::Transport("reset".to_string())));
        let config = CoordinatorConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            },
            ..CoordinatorConfig::default()
        };
        let h = harness_with(fetcher, config).await;

        let result = h.coordinator.request(key("A"), url(URL_A)).await.wait().await;
        assert!(result.is_err());
        assert_eq!(h.fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_a_decode_failure() {
        let fetcher = StubFetcher::new();
        fetcher.respond(URL_A, Ok(FetchedImage::new(b"<html>nope</html>".to_vec())));
        let h = harness(fetcher).await;

        let result = h.coordinator.request(key("A"), url(URL_A)).await.wait().await;
        assert!(matches!(result, Err(LoadError::Decode { .. })));
        assert!(h.coordinator.memory_cache().is_empty());
        assert!(!h.coordinator.disk_cache().contains(&key("A")).await);
    }

    #[tokio::test]
    async fn test_cancelling_sole_subscriber_cancels_fetch() {
        let fetcher = StubFetcher::gated();
        fetcher.respond(URL_A, png(2, 2));
        let h = harness(fetcher).await;

        let subscription = h.coordinator.request(key("A"), url(URL_A)).await;
        let stub = h.fetcher.clone();
        eventually(move || stub.calls() == 1).await;

        drop(subscription);
        assert_eq!(h.coordinator.in_flight_count(), 0);
        let stub = h.fetcher.clone();
        eventually(move || stub.cancelled() == 1).await;

        h.fetcher.release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.fetcher.completed(), 0);
        assert!(h.coordinator.memory_cache().is_empty());
        assert!(!h.coordinator.disk_cache().contains(&key("A")).await);
    }

    #[tokio::test]
    async fn test_cancelling_one_of_two_subscribers_keeps_fetch() {
        let fetcher = StubFetcher::gated();
        fetcher.respond(URL_A, png(2, 2));
        let h = harness(fetcher).await;

        let leaving = h.coordinator.request(key("A"), url(URL_A)).await;
        let staying = h.coordinator.request(key("A"), url(URL_A)).await;
        drop(leaving);
        assert_eq!(h.coordinator.subscriber_count(&key("A")), Some(1));

        h.fetcher.release();
        assert!(staying.wait().await.is_ok());
        assert_eq!(h.fetcher.cancelled(), 0);
        assert!(h.coordinator.memory_cache().peek(&key("A")).is_some());
    }

    #[tokio::test]
    async fn test_dropping_wait_future_withdraws() {
        let fetcher = StubFetcher::gated();
        fetcher.respond(URL_A, png(2, 2));
        let h = harness(fetcher).await;

        let subscription = h.coordinator.request(key("A"), url(URL_A)).await;
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), subscription.wait()).await;
        assert!(timed_out.is_err());
        assert_eq!(h.coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_does_not_affect_other_keys() {
        let fetcher = StubFetcher::gated();
        fetcher.respond(URL_A, png(2, 2));
        fetcher.respond(URL_B, png(3, 3));
        let h = harness(fetcher).await;

        let a = h.coordinator.request(key("A"), url(URL_A)).await;
        let b = h.coordinator.request(key("B"), url(URL_B)).await;
        drop(a);

        h.fetcher.release();
        let image = b.wait().await.unwrap();
        assert_eq!(image.width(), 3);
        assert!(h.coordinator.memory_cache().peek(&key("A")).is_none());
    }

    #[tokio::test]
    async fn test_no_store_response_is_served_but_not_cached() {
        let fetcher = StubFetcher::new();
        let mut response = FetchedImage::new(sample_png(2, 2));
        response.max_age = Some(Duration::ZERO);
        fetcher.respond(URL_A, Ok(response));
        let h = harness(fetcher).await;

        let image = h.coordinator.request(key("A"), url(URL_A)).await.wait().await;
        assert!(image.is_ok());
        assert!(h.coordinator.memory_cache().is_empty());
        assert!(!h.coordinator.disk_cache().contains(&key("A")).await);
    }

    #[tokio::test]
    async fn test_concurrency_limit_serializes_distinct_keys() {
        let fetcher = StubFetcher::gated();
        fetcher.respond(URL_A, png(2, 2));
        fetcher.respond(URL_B, png(2, 2));
        let config = CoordinatorConfig {
            max_concurrent_fetches: 1,
            ..CoordinatorConfig::default()
        };
        let h = harness_with(fetcher, config).await;

        let a = h.coordinator.request(key("A"), url(URL_A)).await;
        let b = h.coordinator.request(key("B"), url(URL_B)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.fetcher.calls(), 1);

        h.fetcher.release();
        assert!(a.wait().await.is_ok());
        assert!(b.wait().await.is_ok());
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_weak_handle_does_not_keep_coordinator_alive() {
        let h = harness(StubFetcher::new()).await;
        let weak = h.coordinator.downgrade();
        assert!(weak.upgrade().is_some());
        drop(h);
        assert!(weak.upgrade().is_none());
    }
}
