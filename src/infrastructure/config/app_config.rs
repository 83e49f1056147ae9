//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::infrastructure::image::{
    CoordinatorConfig, DEFAULT_MAX_CACHE_SIZE, DEFAULT_MAX_MEMORY_BYTES, DEFAULT_USER_AGENT,
    EvictionPolicy, RetryPolicy, default_cache_dir,
};

use super::args::CliArgs;

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration, read from `config.toml` and overridden by CLI flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log file path. Logs go to stderr when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Cache tiers.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Network fetching.
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memory budget in bytes (raw plus decoded).
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,

    /// Disk budget in bytes.
    #[serde(default = "default_max_disk_bytes")]
    pub max_disk_bytes: u64,

    /// Maximum entry age in seconds. `0` keeps entries until evicted.
    #[serde(default = "default_max_entry_age_secs")]
    pub max_entry_age_secs: u64,

    /// Disk cache directory. Defaults to the platform cache dir.
    /// The cache is not encrypted; do not use sensitive identifiers.
    #[serde(default)]
    pub disk_location: Option<PathBuf>,

    /// Memory eviction policy.
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,

    /// Downscale decoded images larger than this in either dimension.
    #[serde(default)]
    pub max_decoded_dimension: Option<u32>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_max_memory_bytes(),
            max_disk_bytes: default_max_disk_bytes(),
            max_entry_age_secs: default_max_entry_age_secs(),
            disk_location: None,
            eviction_policy: EvictionPolicy::default(),
            max_decoded_dimension: None,
        }
    }
}

impl CacheConfig {
    /// Maximum entry age, `None` when aging is disabled.
    #[must_use]
    pub const fn max_entry_age(&self) -> Option<Duration> {
        if self.max_entry_age_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_entry_age_secs))
        }
    }

    /// Returns effective disk cache directory.
    #[must_use]
    pub fn effective_disk_location(&self) -> PathBuf {
        self.disk_location.clone().unwrap_or_else(default_cache_dir)
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Deadline for a single fetch, in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Maximum concurrent network fetches.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// `User-Agent` header.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Extra attempts after a transient failure. `0` disables retries.
    #[serde(default)]
    pub retry_attempts: u32,

    /// Delay between attempts, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            user_agent: default_user_agent(),
            retry_attempts: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_max_memory_bytes() -> u64 {
    DEFAULT_MAX_MEMORY_BYTES
}

fn default_max_disk_bytes() -> u64 {
    DEFAULT_MAX_CACHE_SIZE
}

fn default_max_entry_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(disk_location) = &args.disk_location {
            self.cache.disk_location = Some(disk_location.clone());
        }
        if let Some(max_memory_bytes) = args.max_memory_bytes {
            self.cache.max_memory_bytes = max_memory_bytes;
        }
        if let Some(max_disk_bytes) = args.max_disk_bytes {
            self.cache.max_disk_bytes = max_disk_bytes;
        }
        if let Some(max_entry_age_secs) = args.max_entry_age_secs {
            self.cache.max_entry_age_secs = max_entry_age_secs;
        }
        if let Some(eviction_policy) = args.eviction_policy {
            self.cache.eviction_policy = eviction_policy;
        }
        if let Some(fetch_timeout_secs) = args.fetch_timeout_secs {
            self.network.fetch_timeout_secs = fetch_timeout_secs;
        }
        if let Some(retry_attempts) = args.retry_attempts {
            self.network.retry_attempts = retry_attempts;
        }
    }

    /// Coordinator settings derived from this configuration.
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            fetch_timeout: Duration::from_secs(self.network.fetch_timeout_secs.max(1)),
            max_entry_age: self.cache.max_entry_age(),
            max_concurrent_fetches: self.network.max_concurrent_fetches.max(1),
            max_decoded_dimension: self.cache.max_decoded_dimension,
            retry: RetryPolicy {
                max_attempts: self.network.retry_attempts.saturating_add(1),
                backoff: Duration::from_millis(self.network.retry_backoff_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_partial_config() {
        let toml_content = r#"
            log_level = "debug"

            [cache]
            max_memory_bytes = 1024
            max_entry_age_secs = 0
            eviction_policy = "largest-first"
            disk_location = "/var/cache/images"

            [network]
            retry_attempts = 2
        "#;

        let config: AppConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.cache.max_memory_bytes, 1024);
        assert_eq!(config.cache.max_disk_bytes, DEFAULT_MAX_CACHE_SIZE);
        assert_eq!(config.cache.max_entry_age(), None);
        assert_eq!(config.cache.eviction_policy, EvictionPolicy::LargestFirst);
        assert_eq!(
            config.cache.effective_disk_location(),
            PathBuf::from("/var/cache/images")
        );
        assert_eq!(config.network.fetch_timeout_secs, 30);
        assert_eq!(config.coordinator_config().retry.max_attempts, 3);
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.cache.max_memory_bytes, 64 * 1024 * 1024);
        assert_eq!(
            config.cache.max_entry_age(),
            Some(Duration::from_secs(7 * 24 * 60 * 60))
        );

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.fetch_timeout, Duration::from_secs(30));
        assert_eq!(coordinator.max_concurrent_fetches, 4);
        assert_eq!(coordinator.retry.max_attempts, RetryPolicy::none().max_attempts);
        assert_eq!(coordinator.retry.backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config = AppConfig::default();
        let args = CliArgs::parse_from([
            "urlimage",
            "--max-entry-age-secs",
            "60",
            "--eviction-policy",
            "largest-first",
            "--log-level",
            "warn",
            "stats",
        ]);

        config.merge_with_args(&args);

        assert_eq!(config.cache.max_entry_age(), Some(Duration::from_secs(60)));
        assert_eq!(config.cache.eviction_policy, EvictionPolicy::LargestFirst);
        assert_eq!(config.log_level, LogLevel::Warn);
        assert_eq!(config.cache.max_memory_bytes, DEFAULT_MAX_MEMORY_BYTES);
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut config = AppConfig::default();
        config.network.user_agent = "test-agent".to_string();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.network.user_agent, "test-agent");
        assert_eq!(parsed.cache.max_disk_bytes, config.cache.max_disk_bytes);
    }
}
