//! Application layer with the consumer-facing services.

/// Image service and load sessions.
pub mod services;

pub use services::{ImageLoadSession, ImageService, ServiceError, ServiceStats, SessionHandle};
