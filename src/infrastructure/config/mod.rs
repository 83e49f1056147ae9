//! Application configuration.

/// Configuration values and defaults.
pub mod app_config;
/// Command-line arguments.
pub mod args;
/// Loading and saving the configuration file.
pub mod storage;

pub use app_config::{AppConfig, CacheConfig, LogLevel, NetworkConfig};
pub use args::{CliArgs, Command};
pub use storage::{ConfigError, ConfigStore};
