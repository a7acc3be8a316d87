//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.
//! All violations are collected and reported together.

use super::Config;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("database.path must not be empty")]
    EmptyDatabasePath,
    #[error("storage.base_dir must not be empty")]
    EmptyBaseDir,
    #[error("storage.lock_dir must not be empty")]
    EmptyLockDir,
    #[error("tracker.refresh_interval_secs must be greater than zero")]
    ZeroRefreshInterval,
    #[error("fetcher.batch_size must be greater than zero")]
    ZeroBatchSize,
    #[error("fetcher.max_batches_per_cycle must be greater than zero")]
    ZeroCycleLimit,
    #[error("retry.max_attempts must be greater than zero")]
    ZeroMaxAttempts,
    #[error("retry.backoff_base_secs ({base}) exceeds backoff_ceiling_secs ({ceiling})")]
    BackoffBaseAboveCeiling { base: u64, ceiling: u64 },
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.database.path.is_empty() {
        errors.push(ValidationError::EmptyDatabasePath);
    }
    if config.storage.base_dir.is_empty() {
        errors.push(ValidationError::EmptyBaseDir);
    }
    if config.storage.lock_dir.is_empty() {
        errors.push(ValidationError::EmptyLockDir);
    }
    if config.tracker.refresh_interval_secs == 0 {
        errors.push(ValidationError::ZeroRefreshInterval);
    }
    if config.fetcher.batch_size == 0 {
        errors.push(ValidationError::ZeroBatchSize);
    }
    if config.fetcher.max_batches_per_cycle == 0 {
        errors.push(ValidationError::ZeroCycleLimit);
    }
    if config.retry.max_attempts == 0 {
        errors.push(ValidationError::ZeroMaxAttempts);
    }
    if config.retry.backoff_base_secs > config.retry.backoff_ceiling_secs {
        errors.push(ValidationError::BackoffBaseAboveCeiling {
            base: config.retry.backoff_base_secs,
            ceiling: config.retry.backoff_ceiling_secs,
        });
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut config = Config::default();
        config.fetcher.batch_size = 0;
        let errors = validate(&config).unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::ZeroBatchSize))
        );
    }

    #[test]
    fn collects_multiple_errors() {
        let mut config = Config::default();
        config.database.path = String::new();
        config.retry.max_attempts = 0;
        config.retry.backoff_base_secs = 7200;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
