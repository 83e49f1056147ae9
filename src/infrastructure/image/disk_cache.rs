//! Disk-based image cache for persistence across sessions.
//!
//! Each entry is one file `<key>.entry`:
//!
//! ```text
//! "UIMG" | version: u16 BE | header_len: u32 BE | JSON header | payload
//! ```
//!
//! Files are written to a unique temporary name and renamed into place, so a
//! reader sees either the previous entry or the complete new one. The cache is
//! not encrypted; identifiers and URLs are stored in clear text.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::domain::entities::{CacheEntry, CacheKey, is_expired_record};
use crate::domain::errors::{StorageError, StorageResult};

/// Maximum disk cache size in bytes (256 MB default).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 256 * 1024 * 1024;

const MAGIC: &[u8; 4] = b"UIMG";
const FORMAT_VERSION: u16 = 1;
const PREAMBLE_LEN: usize = 4 + 2 + 4;
const MAX_HEADER_LEN: usize = 64 * 1024;
const ENTRY_EXTENSION: &str = "entry";
const TMP_EXTENSION: &str = "tmp";
/// Temp files older than this belong to writes that never finished.
const STALE_TMP_AGE: Duration = Duration::from_secs(10 * 60);

/// Metadata record stored in front of every payload.
#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    key: String,
    url: Option<String>,
    content_type: Option<String>,
    fetched_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    size_bytes: u64,
    sha256: String,
}

impl EntryHeader {
    fn is_expired(&self, now: DateTime<Utc>, max_age: Option<Duration>) -> bool {
        is_expired_record(self.fetched_at, self.expires_at, now, max_age)
    }
}

/// Flushes the directory so a rename into it survives a crash.
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    fs::File::open(dir).await?.sync_all().await?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn encode_entry(entry: &CacheEntry) -> StorageResult<Vec<u8>> {
    let header = EntryHeader {
        key: entry.key().as_str().to_string(),
        url: entry.url().map(String::from),
        content_type: entry.content_type().map(String::from),
        fetched_at: entry.fetched_at(),
        expires_at: entry.expires_at(),
        size_bytes: entry.size_bytes(),
        sha256: digest(entry.bytes()),
    };
    let header = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| StorageError::corrupt("header too large"))?;

    let mut out = Vec::with_capacity(PREAMBLE_LEN + header.len() + entry.bytes().len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&header_len.to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(entry.bytes());
    Ok(out)
}

/// Parses the fixed preamble, returning the header length.
fn parse_preamble(preamble: &[u8]) -> StorageResult<usize> {
    if preamble.len() < PREAMBLE_LEN {
        return Err(StorageError::corrupt("truncated preamble"));
    }
    if &preamble[..4] != MAGIC {
        return Err(StorageError::corrupt("bad magic"));
    }
    let version = u16::from_be_bytes([preamble[4], preamble[5]]);
    if version != FORMAT_VERSION {
        return Err(StorageError::corrupt(format!("unsupported version {version}")));
    }
    let header_len =
        u32::from_be_bytes([preamble[6], preamble[7], preamble[8], preamble[9]]) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(StorageError::corrupt("header length out of range"));
    }
    Ok(header_len)
}

fn decode_entry(raw: Bytes) -> StorageResult<CacheEntry> {
    let header_len = parse_preamble(&raw)?;
    let payload_start = PREAMBLE_LEN + header_len;
    if raw.len() < payload_start {
        return Err(StorageError::corrupt("truncated header"));
    }

    let header: EntryHeader = serde_json::from_slice(&raw[PREAMBLE_LEN..payload_start])
        .map_err(|e| StorageError::corrupt(format!("unreadable header: {e}")))?;
    let payload = raw.slice(payload_start..);

    if payload.len() as u64 != header.size_bytes {
        return Err(StorageError::corrupt(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.size_bytes
        )));
    }
    if digest(&payload) != header.sha256 {
        return Err(StorageError::corrupt("checksum mismatch"));
    }

    let mut entry = CacheEntry::new(CacheKey::new(header.key), payload)
        .with_content_type(header.content_type)
        .with_fetched_at(header.fetched_at)
        .with_expires_at(header.expires_at);
    if let Some(url) = header.url {
        entry = entry.with_url(url);
    }
    Ok(entry)
}

async fn read_header(path: &Path) -> StorageResult<EntryHeader> {
    let mut file = fs::File::open(path).await?;
    let mut preamble = [0u8; PREAMBLE_LEN];
    file.read_exact(&mut preamble).await?;
    let header_len = parse_preamble(&preamble)?;
    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header).await?;
    serde_json::from_slice(&header)
        .map_err(|e| StorageError::corrupt(format!("unreadable header: {e}")))
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

/// Disk-based store of raw payloads keyed by cache key.
pub struct DiskImageCache {
    cache_dir: PathBuf,
    max_size: u64,
    max_entry_age: Option<Duration>,
    current_size: AtomicU64,
    item_count: AtomicUsize,
}

impl DiskImageCache {
    /// Creates a new disk cache in the specified directory.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be created or listed.
    pub async fn new(
        cache_dir: PathBuf,
        max_size: u64,
        max_entry_age: Option<Duration>,
    ) -> StorageResult<Self> {
        fs::create_dir_all(&cache_dir).await?;
        let mut total_size = 0u64;
        let mut count = 0usize;

        let mut entries = fs::read_dir(&cache_dir).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if has_extension(&path, ENTRY_EXTENSION)
                && let Ok(meta) = entry.metadata().await
            {
                total_size += meta.len();
                count += 1;
            }
        }

        let cache = Self {
            cache_dir,
            max_size,
            max_entry_age,
            current_size: AtomicU64::new(total_size),
            item_count: AtomicUsize::new(count),
        };

        debug!(
            dir = %cache.cache_dir.display(),
            entries = count,
            size = total_size,
            "Opened disk image cache"
        );
        cache.cleanup_if_needed().await;

        Ok(cache)
    }

    /// Creates a cache in the platform cache directory (`.../urlimage/images`).
    ///
    /// # Errors
    /// Returns error if cache directory cannot be created.
    pub async fn default_location(
        max_size: u64,
        max_entry_age: Option<Duration>,
    ) -> StorageResult<Self> {
        Self::new(default_cache_dir(), max_size, max_entry_age).await
    }

    /// Directory holding the entries.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{ENTRY_EXTENSION}", key.as_str()))
    }

    fn tmp_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!(
            "{}.{}.{TMP_EXTENSION}",
            key.as_str(),
            Uuid::new_v4().simple()
        ))
    }

    fn sub_size(&self, bytes: u64) {
        let _ = self
            .current_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    fn sub_count(&self, n: usize) {
        let _ = self
            .item_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)));
    }

    /// Reads a fresh entry.
    ///
    /// Missing, corrupt and expired entries all read as `None`; corrupt and
    /// expired files are removed on the way.
    pub async fn read(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.try_read(key).await {
            Ok(Some(entry)) if entry.is_expired(self.max_entry_age) => {
                debug!(key = %key, fetched_at = %entry.fetched_at(), "Disk cache entry expired");
                self.delete(key).await;
                None
            }
            Ok(Some(entry)) => {
                trace!(key = %key, size = entry.size_bytes(), "Disk cache hit");
                Some(entry)
            }
            Ok(None) => {
                trace!(key = %key, "Disk cache miss");
                None
            }
            Err(StorageError::Corrupt { reason }) => {
                warn!(key = %key, reason = %reason, "Discarding corrupt disk cache entry");
                self.delete(key).await;
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read disk cache entry");
                None
            }
        }
    }

    async fn try_read(&self, key: &CacheKey) -> StorageResult<Option<CacheEntry>> {
        if !key.is_well_formed() {
            return Ok(None);
        }
        let raw = match fs::read(self.entry_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry = decode_entry(Bytes::from(raw))?;
        if entry.key() != key {
            return Err(StorageError::corrupt("entry stored under another key"));
        }
        Ok(Some(entry))
    }

    /// Stores an entry atomically, replacing any previous one.
    ///
    /// # Errors
    /// Returns error if the entry cannot be encoded, written or renamed.
    pub async fn write(&self, entry: &CacheEntry) -> StorageResult<()> {
        let key = entry.key();
        if !key.is_well_formed() {
            return Err(StorageError::corrupt(format!("refusing to store malformed key {key}")));
        }

        let encoded = encode_entry(entry)?;
        let path = self.entry_path(key);
        let tmp = self.tmp_path(key);
        let old_size = fs::metadata(&path).await.map(|m| m.len()).ok();

        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&encoded).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = sync_dir(&self.cache_dir).await {
            warn!(key = %key, error = %e, "Failed to sync disk cache directory");
        }

        let new_size = encoded.len() as u64;
        if let Some(old) = old_size {
            self.sub_size(old);
        } else {
            self.item_count.fetch_add(1, Ordering::Relaxed);
        }
        self.current_size.fetch_add(new_size, Ordering::Relaxed);

        debug!(key = %key, path = %path.display(), size = new_size, "Stored image in disk cache");

        self.cleanup_if_needed().await;

        Ok(())
    }

    /// Removes an entry. Returns true if a file was removed.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        if !key.is_well_formed() {
            return false;
        }
        let path = self.entry_path(key);
        let size = fs::metadata(&path).await.map(|m| m.len()).ok();
        match fs::remove_file(&path).await {
            Ok(()) => {
                if let Some(s) = size {
                    self.sub_size(s);
                }
                self.sub_count(1);
                debug!(key = %key, "Deleted entry from disk cache");
                true
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to delete from disk cache");
                }
                false
            }
        }
    }

    /// Removes expired and unreadable entries plus abandoned temp files.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be read.
    pub async fn purge_expired(&self) -> StorageResult<usize> {
        let now = Utc::now();
        let mut removed = 0usize;
        let mut entries = fs::read_dir(&self.cache_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            if has_extension(&path, TMP_EXTENSION) {
                let stale = entry
                    .metadata()
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|modified| modified.elapsed().ok())
                    .is_some_and(|age| age > STALE_TMP_AGE);
                if stale && fs::remove_file(&path).await.is_ok() {
                    debug!(path = %path.display(), "Removed abandoned temp file");
                }
                continue;
            }

            if !has_extension(&path, ENTRY_EXTENSION) {
                continue;
            }

            let remove = match read_header(&path).await {
                Ok(header) => header.is_expired(now, self.max_entry_age),
                Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Removing unreadable cache entry");
                    true
                }
            };
            if !remove {
                continue;
            }

            let size = entry.metadata().await.map(|m| m.len()).ok();
            match fs::remove_file(&path).await {
                Ok(()) => {
                    if let Some(s) = size {
                        self.sub_size(s);
                    }
                    self.sub_count(1);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to purge cache entry"),
            }
        }

        debug!(removed = removed, "Purged expired disk cache entries");
        Ok(removed)
    }

    /// Clears the entire disk cache.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be read.
    pub async fn clear(&self) -> StorageResult<()> {
        let mut entries = fs::read_dir(&self.cache_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if (has_extension(&path, ENTRY_EXTENSION) || has_extension(&path, TMP_EXTENSION))
                && fs::remove_file(&path).await.is_err()
            {
                warn!(path = %path.display(), "Failed to remove cache file");
            }
        }
        self.current_size.store(0, Ordering::Relaxed);
        self.item_count.store(0, Ordering::Relaxed);
        debug!("Cleared disk cache");
        Ok(())
    }

    /// Returns the current cache size in bytes.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Returns the number of cached files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured byte budget.
    #[must_use]
    pub const fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Cleans up least recently accessed entries if over size limit.
    async fn cleanup_if_needed(&self) {
        let current_size = self.current_size();
        if current_size <= self.max_size {
            return;
        }

        debug!(
            current_size = current_size,
            max_size = self.max_size,
            "Disk cache over limit, cleaning up"
        );

        let Ok(mut entries) = fs::read_dir(&self.cache_dir).await else {
            return;
        };

        let mut files: Vec<(PathBuf, SystemTime, u64)> = Vec::new();

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !has_extension(&path, ENTRY_EXTENSION) {
                continue;
            }

            if let Ok(meta) = entry.metadata().await {
                let accessed = meta
                    .accessed()
                    .or_else(|_| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                files.push((path, accessed, meta.len()));
            }
        }

        files.sort_by_key(|(_, time, _)| *time);

        let mut freed_size = 0u64;
        let mut freed_count = 0usize;
        let target = current_size - self.max_size + (self.max_size / 10);

        for (path, _, size) in files {
            if freed_size >= target {
                break;
            }

            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove old cache file");
            } else {
                trace!(path = %path.display(), "Removed old cache file");
                freed_size += size;
                freed_count += 1;
            }
        }
        self.sub_size(freed_size);
        self.sub_count(freed_count);

        debug!(
            freed_size = freed_size,
            freed_count = freed_count,
            "Disk cache cleanup complete"
        );
    }

    /// Checks if an entry file exists, fresh or not.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        key.is_well_formed() && fs::try_exists(self.entry_path(key)).await.unwrap_or(false)
    }
}

/// Returns the default cache directory path.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from(crate::APP_QUALIFIER, crate::APP_ORGANIZATION, crate::NAME)
        .map_or_else(
            || {
                std::env::temp_dir()
                    .join(crate::NAME)
                    .join("cache")
                    .join("images")
            },
            |dirs| dirs.cache_dir().join("images"),
        )
}
