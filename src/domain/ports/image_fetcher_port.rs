//! Port for the network collaborator that retrieves image payloads.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::domain::errors::FetchError;

/// Payload returned by a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    /// Raw response body.
    pub bytes: Bytes,
    /// `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// Freshness lifetime announced by the server, if any.
    pub max_age: Option<Duration>,
}

impl FetchedImage {
    /// Creates a payload without caching hints.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
            max_age: None,
        }
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Port for network retrieval.
///
/// Cancellation is cooperative: dropping the returned future must abandon the
/// request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageFetcherPort: Send + Sync {
    /// Fetches the payload at `url`, giving up once `deadline` has elapsed.
    async fn fetch(&self, url: &Url, deadline: Duration) -> Result<FetchedImage, FetchError>;
}
