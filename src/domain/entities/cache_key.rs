//! Cache key value object.

use std::fmt;

use sha2::{Digest, Sha256};

/// Stable identifier of a cached image.
///
/// Always a 32 character lowercase hex string, so it is safe to use as a file
/// name in the disk cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    const IDENTIFIER_DOMAIN: &'static str = "id:";
    const URL_DOMAIN: &'static str = "url:";

    /// Wraps an already derived key (e.g. a file stem read back from disk).
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derives a key from an explicit caller supplied identifier.
    #[must_use]
    pub fn from_identifier(identifier: &str) -> Self {
        Self::hashed(Self::IDENTIFIER_DOMAIN, identifier)
    }

    /// Derives a key from a normalized URL string.
    #[must_use]
    pub fn from_normalized_url(url: &str) -> Self {
        Self::hashed(Self::URL_DOMAIN, url)
    }

    fn hashed(domain: &str, input: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        hasher.update(input.as_bytes());
        let result = hasher.finalize();
        Self(hex::encode(&result[..16]))
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the value looks like a derived key.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 32 && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
