//! Cached payload with its metadata record.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::CacheKey;

/// Freshness rule for a stored record.
///
/// A record is expired once its explicit expiry has passed or once it is
/// older than `max_age`. Records stamped in the future are considered fresh.
#[must_use]
pub fn is_expired_record(
    fetched_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_age: Option<Duration>,
) -> bool {
    if expires_at.is_some_and(|expires_at| expires_at <= now) {
        return true;
    }
    max_age.is_some_and(|max_age| {
        (now - fetched_at)
            .to_std()
            .is_ok_and(|age| age > max_age)
    })
}

/// Raw fetched bytes plus the metadata the caches need to judge freshness.
///
/// Entries are immutable; an update is a new entry replacing the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    key: CacheKey,
    bytes: Bytes,
    url: Option<String>,
    content_type: Option<String>,
    fetched_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Creates an entry fetched now.
    #[must_use]
    pub fn new(key: CacheKey, bytes: impl Into<Bytes>) -> Self {
        Self {
            key,
            bytes: bytes.into(),
            url: None,
            content_type: None,
            fetched_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Sets the source URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    /// Overrides the fetch timestamp.
    #[must_use]
    pub const fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    /// Sets an absolute expiry (e.g. from `Cache-Control: max-age`).
    #[must_use]
    pub const fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Cache key.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Raw payload.
    #[must_use]
    pub const fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Source URL, if known.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// `Content-Type` of the payload, if known.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// When the payload was fetched.
    #[must_use]
    pub const fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Explicit expiry, if the server sent one.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Returns true if the entry must no longer be served at `now`.
    ///
    /// See [`is_expired_record`].
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>, max_age: Option<Duration>) -> bool {
        is_expired_record(self.fetched_at, self.expires_at, now, max_age)
    }

    /// Same as [`Self::is_expired_at`] evaluated against the current time.
    #[must_use]
    pub fn is_expired(&self, max_age: Option<Duration>) -> bool {
        self.is_expired_at(Utc::now(), max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn entry() -> CacheEntry {
        CacheEntry::new(CacheKey::from_identifier("e"), vec![1u8, 2, 3])
    }

    #[test]
    fn test_size_matches_payload() {
        assert_eq!(entry().size_bytes(), 3);
    }

    #[test]
    fn test_fresh_within_max_age() {
        let e = entry();
        assert!(!e.is_expired(Some(Duration::from_secs(60))));
        assert!(!e.is_expired(None));
    }

    #[test]
    fn test_expired_past_max_age() {
        let e = entry().with_fetched_at(Utc::now() - TimeDelta::hours(2));
        assert!(e.is_expired(Some(Duration::from_secs(3600))));
        assert!(!e.is_expired(None));
    }

    #[test]
    fn test_explicit_expiry() {
        let now = Utc::now();
        let e = entry().with_expires_at(Some(now - TimeDelta::seconds(1)));
        assert!(e.is_expired_at(now, None));

        let e = entry().with_expires_at(Some(now + TimeDelta::hours(1)));
        assert!(!e.is_expired_at(now, Some(Duration::from_secs(7200))));
    }

    #[test]
    fn test_record_rule_without_an_entry() {
        let now = Utc::now();
        let fetched = now - TimeDelta::minutes(10);
        assert!(is_expired_record(fetched, None, now, Some(Duration::from_secs(60))));
        assert!(!is_expired_record(fetched, None, now, None));
        assert!(is_expired_record(now, Some(now), now, None));
    }

    #[test]
    fn test_future_timestamp_is_fresh() {
        let e = entry().with_fetched_at(Utc::now() + TimeDelta::minutes(5));
        assert!(!e.is_expired(Some(Duration::from_secs(1))));
    }
}
