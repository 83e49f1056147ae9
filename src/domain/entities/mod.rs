//! Domain entity definitions.

mod cache_entry;
mod cache_key;
mod image;
mod load_phase;

pub use cache_entry::{CacheEntry, is_expired_record};
pub use cache_key::CacheKey;
pub use image::{ImageSource, LoadedImage};
pub use load_phase::{LoadPhase, LoadResult};
