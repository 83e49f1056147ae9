use super::app_config::LogLevel;
use crate::infrastructure::image::EvictionPolicy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "urlimage",
    version,
    about = "Fetch-and-cache engine for URL images",
    long_about = None
)]
#[allow(missing_docs)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Disk cache directory.
    #[arg(long, value_name = "PATH", global = true)]
    pub disk_location: Option<PathBuf>,

    /// Memory cache budget in bytes.
    #[arg(long, global = true)]
    pub max_memory_bytes: Option<u64>,

    /// Disk cache budget in bytes.
    #[arg(long, global = true)]
    pub max_disk_bytes: Option<u64>,

    /// Maximum entry age in seconds (0 disables aging).
    #[arg(long, global = true)]
    pub max_entry_age_secs: Option<u64>,

    /// Memory eviction policy.
    #[arg(long, value_enum, global = true)]
    pub eviction_policy: Option<EvictionPolicy>,

    /// Network fetch deadline in seconds.
    #[arg(long, global = true)]
    pub fetch_timeout_secs: Option<u64>,

    /// Extra attempts after a transient network failure.
    #[arg(long, global = true)]
    pub retry_attempts: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load an image through the cache and print what was loaded.
    Fetch {
        /// Image URL.
        url: Option<String>,

        /// Stable identifier used as cache key instead of the URL.
        #[arg(short, long)]
        identifier: Option<String>,

        /// Write the decoded image to this file (format from extension).
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Print the cache key for a URL or identifier.
    Key {
        /// Image URL.
        url: Option<String>,

        /// Stable identifier.
        #[arg(short, long)]
        identifier: Option<String>,
    },
    /// Remove expired disk entries.
    Purge,
    /// Remove every cached entry.
    Clear,
    /// Print cache statistics.
    Stats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch_with_identifier() {
        let args = CliArgs::parse_from([
            "urlimage",
            "fetch",
            "https://img.example.com/a.png",
            "--identifier",
            "avatar-42",
        ]);
        match args.command {
            Command::Fetch {
                url, identifier, ..
            } => {
                assert_eq!(url.as_deref(), Some("https://img.example.com/a.png"));
                assert_eq!(identifier.as_deref(), Some("avatar-42"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::parse_from(["urlimage", "purge", "--max-entry-age-secs", "10"]);
        assert!(matches!(args.command, Command::Purge));
        assert_eq!(args.max_entry_age_secs, Some(10));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(CliArgs::try_parse_from(["urlimage"]).is_err());
    }
}
