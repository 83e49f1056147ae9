use url::Url;

use crate::domain::entities::CacheKey;

/// Derives cache keys from a `(url, identifier)` binding.
pub struct KeyResolver;

impl KeyResolver {
    /// Resolves the cache key for a binding.
    ///
    /// An explicit identifier always wins, so the key does not change when the
    /// URL of the same logical image rotates. Returns `None` when neither input
    /// is usable; callers must not start a fetch in that case.
    #[must_use]
    pub fn resolve(url: Option<&Url>, identifier: Option<&str>) -> Option<CacheKey> {
        if let Some(identifier) = identifier.filter(|id| !id.is_empty()) {
            return Some(CacheKey::from_identifier(identifier));
        }

        url.map(|url| CacheKey::from_normalized_url(&Self::normalize(url)))
    }

    /// Resolves from a raw URL string. Unparsable URLs count as absent.
    #[must_use]
    pub fn resolve_str(url: Option<&str>, identifier: Option<&str>) -> Option<CacheKey> {
        let parsed = url.and_then(|raw| Url::parse(raw.trim()).ok());
        Self::resolve(parsed.as_ref(), identifier)
    }

    /// Normalized string form of a URL used for hashing.
    ///
    /// Parsing already lowercases scheme and host and drops default ports; the
    /// fragment never reaches the server so it is not part of the identity.
    #[must_use]
    pub fn normalize(url: &Url) -> String {
        let mut url = url.clone();
        url.set_fragment(None);
        url.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_identifier_wins_over_url() {
        let a = KeyResolver::resolve(Some(&url("https://a.example/1.png")), Some("avatar-42"));
        let b = KeyResolver::resolve(Some(&url("https://b.example/2.png")), Some("avatar-42"));
        let c = KeyResolver::resolve(None, Some("avatar-42"));
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_distinct_urls_yield_distinct_keys() {
        let a = KeyResolver::resolve(Some(&url("https://example.com/1.png")), None);
        let b = KeyResolver::resolve(Some(&url("https://example.com/2.png")), None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_nothing_to_resolve() {
        assert_eq!(KeyResolver::resolve(None, None), None);
        assert_eq!(KeyResolver::resolve(None, Some("")), None);
        assert_eq!(KeyResolver::resolve_str(Some("not a url"), None), None);
    }

    #[test]
    fn test_empty_identifier_falls_back_to_url() {
        let u = url("https://example.com/1.png");
        assert_eq!(
            KeyResolver::resolve(Some(&u), Some("")),
            KeyResolver::resolve(Some(&u), None)
        );
    }

    #[test_case("HTTPS://Example.COM/a.png", "https://example.com/a.png" ; "scheme_and_host_case")]
    #[test_case("https://example.com:443/a.png", "https://example.com/a.png" ; "default_port")]
    #[test_case("https://example.com/a.png#top", "https://example.com/a.png" ; "fragment")]
    #[test_case("https://example.com", "https://example.com/" ; "empty_path")]
    fn test_equivalent_urls_share_a_key(left: &str, right: &str) {
        assert_eq!(
            KeyResolver::resolve_str(Some(left), None),
            KeyResolver::resolve_str(Some(right), None)
        );
    }

    #[test]
    fn test_query_is_part_of_identity() {
        assert_ne!(
            KeyResolver::resolve_str(Some("https://example.com/a.png?size=64"), None),
            KeyResolver::resolve_str(Some("https://example.com/a.png?size=128"), None)
        );
    }
}
