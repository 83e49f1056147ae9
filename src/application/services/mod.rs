pub mod image_service;
pub mod image_session;

pub use image_service::{ImageService, ServiceError, ServiceStats, SessionHandle};
pub use image_session::ImageLoadSession;
