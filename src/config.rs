//! Engine configuration: loading and validation.
//!
//! The embedding application owns `S3Provider`/`Connection` records; this
//! struct covers process-wide knobs the engine itself needs (staging
//! directory, log-bus batching, default retention).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Root directory for staged dump files in file-upload mode.
    pub staging_root: PathBuf,

    /// Path to the SQLite database backing the [`crate::repository::Repository`].
    pub database_path: PathBuf,

    /// Log-bus durable flush configuration.
    pub log_bus: LogBusConfig,

    /// Retention applied to schedules that do not specify their own.
    pub default_retention_days: Option<u32>,

    /// Share token TTL bounds, in hours.
    pub share_token: ShareTokenConfig,
}

/// Durable log flush batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBusConfig {
    /// Live per-backup channel capacity.
    pub channel_capacity: usize,

    /// Flush the durable queue once it reaches this many lines.
    pub flush_batch_size: usize,

    /// Flush the durable queue at least this often regardless of size.
    pub flush_interval_ms: u64,

    /// Retry attempts on a busy database before re-queueing.
    pub flush_retry_attempts: u32,

    /// Initial backoff before the first retry; doubles each attempt.
    pub flush_retry_base_ms: u64,
}

/// Share link issuance bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareTokenConfig {
    pub default_ttl_hours: u32,
    pub min_ttl_hours: u32,
    pub max_ttl_hours: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from("/var/lib/backup-orchestrator/staging"),
            database_path: PathBuf::from("/var/lib/backup-orchestrator/backups.sqlite3"),
            log_bus: LogBusConfig::default(),
            default_retention_days: Some(30),
            share_token: ShareTokenConfig::default(),
        }
    }
}

impl Default for LogBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            flush_batch_size: 10,
            flush_interval_ms: 2_000,
            flush_retry_attempts: 5,
            flush_retry_base_ms: 10,
        }
    }
}

impl Default for ShareTokenConfig {
    fn default() -> Self {
        Self {
            default_ttl_hours: 24,
            min_ttl_hours: 1,
            max_ttl_hours: 168,
        }
    }
}

impl BackupConfig {
    /// Load configuration from defaults, an optional `config/backup.toml`,
    /// then environment variables prefixed `BACKUP__` (double underscore
    /// separating nested fields, e.g. `BACKUP__LOG_BUS__FLUSH_BATCH_SIZE`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&BackupConfig::default())?)
            .add_source(config::File::with_name("config/backup").required(false))
            .add_source(config::Environment::with_prefix("BACKUP").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Validate cross-field invariants not expressible in `Default`.
    pub fn validate(&self) -> Result<(), String> {
        if self.log_bus.channel_capacity == 0 {
            return Err("log_bus.channel_capacity must be greater than 0".to_string());
        }
        if self.share_token.min_ttl_hours == 0 || self.share_token.min_ttl_hours > self.share_token.max_ttl_hours {
            return Err("share_token ttl bounds are invalid".to_string());
        }
        if !(self.share_token.min_ttl_hours..=self.share_token.max_ttl_hours)
            .contains(&self.share_token.default_ttl_hours)
        {
            return Err("share_token.default_ttl_hours must fall within [min, max]".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(BackupConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_channel_capacity_is_rejected() {
        let mut cfg = BackupConfig::default();
        cfg.log_bus.channel_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_ttl_outside_bounds_is_rejected() {
        let mut cfg = BackupConfig::default();
        cfg.share_token.default_ttl_hours = 200;
        assert!(cfg.validate().is_err());
    }
}
