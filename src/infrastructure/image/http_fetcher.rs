//! `reqwest` adapter for the network collaborator port.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderMap};
use tracing::{debug, trace};
use url::Url;

use crate::domain::errors::FetchError;
use crate::domain::ports::{FetchedImage, ImageFetcherPort};

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("urlimage/", env!("CARGO_PKG_VERSION"));

/// Downloads image payloads over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    /// Creates a fetcher with its own connection pool.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn download(&self, url: &Url, deadline: Duration) -> Result<FetchedImage, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| classify(&e, deadline))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let max_age = cache_max_age(headers);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify(&e, deadline))?;

        trace!(url = %url, size = bytes.len(), "Downloaded image body");

        Ok(FetchedImage {
            bytes,
            content_type,
            max_age,
        })
    }
}

fn classify(err: &reqwest::Error, deadline: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(deadline)
    } else if err.is_builder() {
        FetchError::InvalidRequest(err.to_string())
    } else {
        FetchError::Transport(err.to_string())
    }
}

/// Reads the freshness lifetime from `Cache-Control`.
///
/// `no-store` and `no-cache` map to a zero lifetime so the entry is never served
/// from cache again.
fn cache_max_age(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(CACHE_CONTROL)?.to_str().ok()?;
    let mut max_age = None;
    for directive in value.split(',').map(str::trim) {
        let lower = directive.to_ascii_lowercase();
        if lower == "no-store" || lower == "no-cache" {
            return Some(Duration::ZERO);
        }
        if let Some(secs) = lower.strip_prefix("max-age=") {
            max_age = secs.trim_matches('"').parse::<u64>().ok().map(Duration::from_secs);
        }
    }
    max_age
}

#[async_trait]
impl ImageFetcherPort for HttpImageFetcher {
    async fn fetch(&self, url: &Url, deadline: Duration) -> Result<FetchedImage, FetchError> {
        debug!(url = %url, ?deadline, "Downloading image from network");
        match tokio::time::timeout(deadline, self.download(url, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use test_case::test_case;

    fn headers(cache_control: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(CACHE_CONTROL, HeaderValue::from_str(cache_control).unwrap());
        map
    }

    #[test_case("max-age=60", Some(60) ; "plain")]
    #[test_case("public, max-age=3600, immutable", Some(3600) ; "among_others")]
    #[test_case("Max-Age=10", Some(10) ; "case_insensitive")]
    #[test_case("no-store", Some(0) ; "no_store")]
    #[test_case("private, no-cache", Some(0) ; "no_cache")]
    #[test_case("public", None ; "no_lifetime")]
    #[test_case("max-age=soon", None ; "unparsable")]
    fn test_cache_max_age(value: &str, expected: Option<u64>) {
        assert_eq!(cache_max_age(&headers(value)), expected.map(Duration::from_secs));
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(cache_max_age(&HeaderMap::new()), None);
    }

    #[test]
    fn test_fetcher_creation() {
        assert!(HttpImageFetcher::new(DEFAULT_USER_AGENT).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_transport_error() {
        let fetcher = HttpImageFetcher::new(DEFAULT_USER_AGENT).unwrap();
        let url = Url::parse("http://127.0.0.1:9/none.png").unwrap();
        let err = fetcher
            .fetch(&url, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(_) | FetchError::Timeout(_)));
    }
}
