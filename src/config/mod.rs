//! Configuration loading and management.
//!
//! The configuration is parsed exactly once at startup and passed by
//! reference (or `Arc`) to every component; nothing re-reads it at runtime.
//!
//! Split into:
//! - [`types`]: serde struct definitions and defaults
//! - [`validation`]: startup validation that collects every error found

mod types;
pub mod validation;

pub use types::{
    Config, DatabaseConfig, FetcherConfig, RetryConfig, StorageConfig, TrackerConfig,
};
pub use validation::ValidationError;

use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
