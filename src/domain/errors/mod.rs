//! Domain error types.

mod fetch_error;
mod load_error;
mod storage_error;

pub use fetch_error::FetchError;
pub use load_error::LoadError;
pub use storage_error::{StorageError, StorageResult};
