//! Core configuration struct definitions.

use serde::Deserialize;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Payload and lock file locations.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Registry synchronization (tracker role).
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Batch fetching (fetcher role).
    #[serde(default)]
    pub fetcher: FetcherConfig,
    /// Retry and backoff policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (":memory:" for tests).
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Payload and lock file locations.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for raw message payload files, one subdirectory per channel.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Directory for role lock files.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            lock_dir: default_lock_dir(),
        }
    }
}

/// Tracker (registry synchronization) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Seconds between registry refresh cycles.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

/// Fetcher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// Maximum messages per fetch batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Seconds to sleep between fetch cycles.
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,
    /// Seconds to pause between channels within a cycle.
    #[serde(default = "default_pause_secs")]
    pub pause_secs: u64,
    /// Seconds between re-reads of the channel working set.
    #[serde(default = "default_channel_refresh")]
    pub channel_refresh_secs: u64,
    /// Maximum channels selected per fetch cycle.
    #[serde(default = "default_cycle_limit")]
    pub max_batches_per_cycle: u32,
    /// Total committed batches per invocation; 0 means unlimited.
    /// Overridable with `--max-batches`.
    #[serde(default)]
    pub max_batches: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sleep_secs: default_sleep_secs(),
            pause_secs: default_pause_secs(),
            channel_refresh_secs: default_channel_refresh(),
            max_batches_per_cycle: default_cycle_limit(),
            max_batches: 0,
        }
    }
}

/// Retry and backoff policy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay in seconds for the first retry.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// Ceiling on the computed backoff delay.
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_secs: u64,
    /// Attempts after which a channel becomes permanently failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: default_backoff_base(),
            backoff_ceiling_secs: default_backoff_ceiling(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_db_path() -> String {
    "chantrackd.db".to_string()
}

fn default_base_dir() -> String {
    "messages".to_string()
}

fn default_lock_dir() -> String {
    "locks".to_string()
}

fn default_refresh_interval() -> u64 {
    1800
}

fn default_batch_size() -> u32 {
    100
}

fn default_sleep_secs() -> u64 {
    5
}

fn default_pause_secs() -> u64 {
    1
}

fn default_channel_refresh() -> u64 {
    600
}

fn default_cycle_limit() -> u32 {
    32
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    60
}

fn default_backoff_ceiling() -> u64 {
    3600
}
