//! In-memory image cache bounded by a byte budget.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::domain::entities::{CacheEntry, CacheKey};

use super::decoder::decoded_size;

/// Default memory budget (64 MB).
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Which entries go first when the cache is over budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Least recently used first.
    #[default]
    LeastRecentlyUsed,
    /// Largest entries first, ties broken by recency.
    LargestFirst,
}

/// A cached payload together with its decoded pixels.
#[derive(Clone)]
pub struct CachedImage {
    /// Raw payload and metadata.
    pub entry: CacheEntry,
    /// Decoded image.
    pub image: Arc<image::DynamicImage>,
}

impl CachedImage {
    /// Bytes charged against the memory budget.
    #[must_use]
    pub fn charged_size(&self) -> u64 {
        self.entry.size_bytes() + decoded_size(&self.image)
    }
}

impl fmt::Debug for CachedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedImage")
            .field("key", self.entry.key())
            .field("charged_size", &self.charged_size())
            .finish_non_exhaustive()
    }
}

struct Slot {
    cached: CachedImage,
    size: u64,
}

struct Inner {
    entries: LruCache<CacheKey, Slot>,
    current_bytes: u64,
}

impl Inner {
    fn remove(&mut self, key: &CacheKey) -> Option<Slot> {
        let slot = self.entries.pop(key)?;
        self.current_bytes -= slot.size;
        Some(slot)
    }

    /// Evicts until `current_bytes <= target`, never choosing `keep`.
    /// Returns the number of entries removed.
    fn trim(&mut self, policy: EvictionPolicy, target: u64, keep: Option<&CacheKey>) -> usize {
        let mut evicted = 0;
        while self.current_bytes > target {
            let victim = match policy {
                EvictionPolicy::LeastRecentlyUsed => self
                    .entries
                    .peek_lru()
                    .map(|(k, _)| k.clone())
                    .filter(|k| Some(k) != keep),
                // Iteration runs most recent first, so the last maximum is the
                // least recently used among the largest.
                EvictionPolicy::LargestFirst => self
                    .entries
                    .iter()
                    .filter(|(k, _)| Some(*k) != keep)
                    .fold(None::<(&CacheKey, u64)>, |best, (k, slot)| match best {
                        Some((_, size)) if size > slot.size => best,
                        _ => Some((k, slot.size)),
                    })
                    .map(|(k, _)| k.clone()),
            };

            let Some(key) = victim else {
                break;
            };
            if self.remove(&key).is_some() {
                trace!(key = %key, "Evicted image from memory cache");
                evicted += 1;
            }
        }
        evicted
    }
}

/// In-memory cache for decoded images.
///
/// All mutations go through one mutex so size accounting stays exact under
/// concurrent fetch completions. No lock is ever held across an await.
pub struct MemoryImageCache {
    inner: Mutex<Inner>,
    max_bytes: u64,
    policy: EvictionPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a new cache with the given byte budget and eviction policy.
    #[must_use]
    pub fn new(max_bytes: u64, policy: EvictionPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                current_bytes: 0,
            }),
            max_bytes,
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Creates a new cache with the default budget.
    #[must_use]
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_MAX_MEMORY_BYTES, EvictionPolicy::default())
    }

    /// Looks up an entry and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
            Some(slot.cached.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    /// Peeks at an entry without promoting it.
    pub fn peek(&self, key: &CacheKey) -> Option<CachedImage> {
        self.inner.lock().entries.peek(key).map(|slot| slot.cached.clone())
    }

    /// Stores an entry, replacing any previous one for the same key.
    ///
    /// Other entries are evicted to make room; the new one always stays.
    /// Returns false if the entry alone exceeds the budget and was not stored.
    pub fn put(&self, cached: CachedImage) -> bool {
        let key = cached.entry.key().clone();
        let size = cached.charged_size();
        let mut inner = self.inner.lock();

        if size > self.max_bytes {
            inner.remove(&key);
            warn!(
                key = %key,
                size = size,
                max_bytes = self.max_bytes,
                "Image larger than memory budget, not caching"
            );
            return false;
        }

        inner.remove(&key);
        inner.entries.put(key.clone(), Slot { cached, size });
        inner.current_bytes += size;
        debug!(key = %key, size = size, "Stored image in memory cache");

        let evicted = inner.trim(self.policy, self.max_bytes, Some(&key));
        if evicted > 0 {
            debug!(
                evicted = evicted,
                current_bytes = inner.current_bytes,
                "Memory cache over budget, evicted entries"
            );
        }
        true
    }

    /// Evicts entries with `policy` until at most `target_bytes` are used.
    ///
    /// Returns the number of entries removed.
    pub fn evict(&self, policy: EvictionPolicy, target_bytes: u64) -> usize {
        let mut inner = self.inner.lock();
        let evicted = inner.trim(policy, target_bytes, None);
        if evicted > 0 {
            debug!(evicted = evicted, ?policy, target_bytes, "Evicted images from memory cache");
        }
        evicted
    }

    /// Removes one entry.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            debug!(key = %key, "Removed image from memory cache");
        }
        removed
    }

    /// Clears all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.current_bytes = 0;
        debug!("Cleared memory image cache");
    }

    /// Number of cached images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged.
    #[must_use]
    pub fn current_bytes(&self) -> u64 {
        self.inner.lock().current_bytes
    }

    /// Configured byte budget.
    #[must_use]
    pub const fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: inner.entries.len(),
            bytes: inner.current_bytes,
        }
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
    /// Bytes charged against the budget.
    pub bytes: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache: {} images, {} bytes, {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.bytes, self.hit_rate, self.hits, self.misses
        )
    }
}
