mod image_fetcher_port;

pub use image_fetcher_port::{FetchedImage, ImageFetcherPort};

#[cfg(test)]
pub use image_fetcher_port::MockImageFetcherPort;

#[cfg(test)]
pub mod mocks {
    pub use super::image_fetcher_port::mock::StubFetcher;
}
