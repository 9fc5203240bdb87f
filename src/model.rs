//! Core data model entities (§3).
//!
//! `Connection` and `S3Provider` are owned by the embedding application
//! (user-management, credential storage); this crate only consumes them
//! through the opaque [`crate::notify::ConnectionRegistry`] and
//! [`crate::notify::SettingsProvider`] capability traits. Everything else
//! here is owned end-to-end by [`crate::repository::Repository`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::dump::{ConnectionInfo, DbEngine, SshAuth, SshTunnelConfig};

/// Lifecycle status of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Success,
    CompletedWithErrors,
    Failed,
}

impl BackupStatus {
    /// Whether this status represents a run that has finished (no further
    /// transitions are valid from it).
    pub fn is_terminal(self) -> bool {
        !matches!(self, BackupStatus::InProgress)
    }
}

/// A configured S3-compatible upload destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Provider {
    pub id: Uuid,
    pub owner_connection_id: Uuid,
    pub name: String,
    pub endpoint: String,
    pub region: Option<String>,
    pub bucket: String,
    pub access_key: String,
    /// Ciphertext; decrypted only through `SettingsProvider::decrypt`.
    pub secret_key_ciphertext: Vec<u8>,
    pub use_tls: bool,
    pub path_prefix: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// One backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub database_name: String,
    pub status: BackupStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
    pub md5: Option<String>,
    pub error_message: Option<String>,
    /// Legacy monolithic log text, retained only for rows written before
    /// the line-addressed `backup_logs` table existed.
    pub logs: Option<String>,
    pub schedule_id: Option<Uuid>,
}

/// One (backup, provider) upload outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupProviderBinding {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub provider_id: Uuid,
    pub object_key: String,
    pub uploaded_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub failed: bool,
    pub error_message: Option<String>,
}

/// A single line appended to a backup's durable log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupLogLine {
    pub backup_id: Uuid,
    pub line_number: u64,
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

/// A cron-driven recurring backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub cron_expression: String,
    pub sink_ids: Vec<Uuid>,
    pub retention_days: Option<u32>,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// A time-limited, optionally provider-scoped link to download one backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareToken {
    pub token: String,
    pub backup_id: Uuid,
    pub provider_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_in_progress_is_non_terminal() {
        assert!(!BackupStatus::InProgress.is_terminal());
        assert!(BackupStatus::Success.is_terminal());
        assert!(BackupStatus::CompletedWithErrors.is_terminal());
        assert!(BackupStatus::Failed.is_terminal());
    }
}
