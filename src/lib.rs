//! # Backup Orchestrator
//!
//! Multi-tenant database backup orchestration: per-connection dump
//! supervision, multi-sink compressed upload fan-out, a two-sink log bus,
//! cron-based scheduling with missed-run recovery, and expiring share
//! tokens for downloading completed backups.
//!
//! ## Architecture
//!
//! - [`dump`]: per-engine dump subprocess construction (`pg_dump`,
//!   `mysqldump`, `mongodump`, `redis-cli`), optional SSH tunneling, and
//!   Postgres version/extension probing.
//! - [`upload`]: streaming and file-mode upload fan-out across configured
//!   sinks, with §4.5's partial-failure classification.
//! - [`storage`]: the S3-compatible object-store client trait and its AWS
//!   SDK-backed implementation.
//! - [`checksum`]: a single-pass MD5+SHA-256 `AsyncRead` tee used so
//!   streaming uploads never re-read the source to compute digests.
//! - [`logbus`]: per-backup live log fan-out plus durable, batched,
//!   single-writer append to the backup repository.
//! - [`repository`]: the SQLite-backed system of record for backups,
//!   bindings, logs, schedules, and share tokens.
//! - [`coordinator`]: the Backup Coordinator — orchestrates one run end to
//!   end and owns its status transitions.
//! - [`scheduler`]: the Schedule Manager — cron registry, startup
//!   recovery, and run-end retention.
//! - [`share`]: the Share Token Service — time-limited download links.
//! - [`restore`]: mirrors the backup pipeline in reverse to restore a
//!   completed backup into a live database.
//! - [`model`]: core data model entities shared across the above.
//! - [`notify`]: the opaque capability traits (`ConnectionRegistry`,
//!   `SettingsProvider`, `Notifier`) the embedding application implements.
//! - [`config`]: ambient configuration (staging paths, log bus tuning,
//!   share token TTL bounds).
//! - [`error`]: the crate's typed error surface.
//! - [`sanitize`]: shared string-sanitizing helpers used by both the
//!   upload path and connection-name-derived staging paths.
//!
//! ## Example
//!
//! ```rust,no_run
//! use backup_orchestrator::config::BackupConfig;
//! use backup_orchestrator::repository::Repository;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackupConfig::load()?;
//! let repository = Arc::new(Repository::open(&config.database_path).await?);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![allow(dead_code)]

pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod dump;
pub mod error;
pub mod logbus;
pub mod model;
pub mod notify;
pub mod repository;
pub mod restore;
pub mod sanitize;
pub mod scheduler;
pub mod share;
pub mod storage;
pub mod upload;

pub use config::BackupConfig;
pub use coordinator::Coordinator;
pub use error::{BackupError, Result, StorageError};
pub use logbus::LogBus;
pub use repository::Repository;
pub use scheduler::ScheduleManager;
pub use share::ShareTokenService;

/// Version of the backup orchestration engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
