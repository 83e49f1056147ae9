//! urlimage - A fetch-and-cache engine for URL images.
//!
//! This crate turns a URL or stable identifier into a decoded image through a
//! memory cache, a disk cache and deduplicated network fetches, and publishes
//! each load as an observable phase.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing the image service and load sessions.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing caches, fetching, and configuration.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "urlimage";

/// Qualifier for platform directories.
pub const APP_QUALIFIER: &str = "com";

/// Organization for platform directories.
pub const APP_ORGANIZATION: &str = "linuxmobile";
