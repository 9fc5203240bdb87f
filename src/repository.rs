//! Backup Repository (§4.10): durable store for backups, line-addressed
//! logs, provider bindings, schedules, and share tokens.
//!
//! Backed by `rusqlite` (bundled SQLite) in WAL mode with a 5-second busy
//! timeout, wrapped behind a `tokio::sync::Mutex<Connection>` and
//! `spawn_blocking` for every query since rusqlite itself is synchronous.
//! This mutex also happens to provide the single-writer property §4.9's
//! log bus needs for `append_log`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BackupError, Result};
use crate::model::{Backup, BackupProviderBinding, BackupStatus, S3Provider, Schedule, ShareToken};

/// Durable store handle. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct Repository {
    conn: Arc<Mutex<Connection>>,
}

impl Repository {
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| BackupError::Database(rusqlite::Error::InvalidParameterName(e.to_string())))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            f(&guard)
        })
        .await
        .map_err(|e| BackupError::Database(rusqlite::Error::InvalidParameterName(e.to_string())))?
        .map_err(BackupError::Database)
    }

    // ---- providers ----

    pub async fn create_provider(&self, provider: S3Provider) -> Result<()> {
        self.with_conn(move |conn| {
            if provider.is_default {
                conn.execute(
                    "UPDATE s3_providers SET is_default = 0 WHERE owner_connection_id = ?1",
                    params![provider.owner_connection_id.to_string()],
                )?;
            }
            conn.execute(
                "INSERT INTO s3_providers (id, owner_connection_id, name, endpoint, region, bucket, access_key, secret_key_ciphertext, use_tls, path_prefix, is_default, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    provider.id.to_string(),
                    provider.owner_connection_id.to_string(),
                    provider.name,
                    provider.endpoint,
                    provider.region,
                    provider.bucket,
                    provider.access_key,
                    provider.secret_key_ciphertext,
                    provider.use_tls,
                    provider.path_prefix,
                    provider.is_default,
                    provider.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Transactionally clear every other default for the owner, then set
    /// this one. Enforces the at-most-one-default invariant.
    pub async fn set_default_provider(&self, owner_connection_id: Uuid, provider_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE s3_providers SET is_default = 0 WHERE owner_connection_id = ?1",
                params![owner_connection_id.to_string()],
            )?;
            tx.execute(
                "UPDATE s3_providers SET is_default = 1 WHERE id = ?1 AND owner_connection_id = ?2",
                params![provider_id.to_string(), owner_connection_id.to_string()],
            )?;
            tx.commit()
        })
        .await
    }

    pub async fn list_providers(&self, owner_connection_id: Uuid) -> Result<Vec<S3Provider>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_connection_id, name, endpoint, region, bucket, access_key, secret_key_ciphertext, use_tls, path_prefix, is_default, created_at
                 FROM s3_providers WHERE owner_connection_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![owner_connection_id.to_string()], row_to_provider)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_default_provider(&self, owner_connection_id: Uuid) -> Result<Option<S3Provider>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, owner_connection_id, name, endpoint, region, bucket, access_key, secret_key_ciphertext, use_tls, path_prefix, is_default, created_at
                 FROM s3_providers WHERE owner_connection_id = ?1 AND is_default = 1",
                params![owner_connection_id.to_string()],
                row_to_provider,
            )
            .optional()
        })
        .await
    }

    // ---- backups ----

    pub async fn create_backup(&self, backup: Backup) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backups (id, connection_id, database_name, status, started_at, completed_at, size_bytes, sha256, md5, error_message, logs, schedule_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    backup.id.to_string(),
                    backup.connection_id.to_string(),
                    backup.database_name,
                    status_str(backup.status),
                    backup.started_at.to_rfc3339(),
                    backup.completed_at.map(|t| t.to_rfc3339()),
                    backup.size_bytes.map(|v| v as i64),
                    backup.sha256,
                    backup.md5,
                    backup.error_message,
                    backup.logs,
                    backup.schedule_id.map(|id| id.to_string()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Partial update. `logs: None` means "do not touch" — the caller is
    /// not omitting a real change, it is declining to mutate the legacy
    /// column, so an empty string is never written over existing logs.
    pub async fn update_backup(
        &self,
        backup_id: Uuid,
        status: Option<BackupStatus>,
        completed_at: Option<DateTime<Utc>>,
        size_bytes: Option<u64>,
        sha256: Option<String>,
        md5: Option<String>,
        error_message: Option<String>,
        logs: Option<String>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            if let Some(status) = status {
                conn.execute(
                    "UPDATE backups SET status = ?1 WHERE id = ?2",
                    params![status_str(status), backup_id.to_string()],
                )?;
            }
            if let Some(completed_at) = completed_at {
                conn.execute(
                    "UPDATE backups SET completed_at = ?1 WHERE id = ?2",
                    params![completed_at.to_rfc3339(), backup_id.to_string()],
                )?;
            }
            if let Some(size_bytes) = size_bytes {
                conn.execute(
                    "UPDATE backups SET size_bytes = ?1 WHERE id = ?2",
                    params![size_bytes as i64, backup_id.to_string()],
                )?;
            }
            if let Some(sha256) = sha256 {
                conn.execute(
                    "UPDATE backups SET sha256 = ?1 WHERE id = ?2",
                    params![sha256, backup_id.to_string()],
                )?;
            }
            if let Some(md5) = md5 {
                conn.execute(
                    "UPDATE backups SET md5 = ?1 WHERE id = ?2",
                    params![md5, backup_id.to_string()],
                )?;
            }
            if let Some(error_message) = error_message {
                conn.execute(
                    "UPDATE backups SET error_message = ?1 WHERE id = ?2",
                    params![error_message, backup_id.to_string()],
                )?;
            }
            // Never overwrite with empty string: callers that do not
            // intend to mutate logs must pass None, not Some("").
            if let Some(logs) = logs {
                if !logs.is_empty() {
                    conn.execute(
                        "UPDATE backups SET logs = ?1 WHERE id = ?2",
                        params![logs, backup_id.to_string()],
                    )?;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn get_backup(&self, backup_id: Uuid) -> Result<Backup> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, connection_id, database_name, status, started_at, completed_at, size_bytes, sha256, md5, error_message, logs, schedule_id
                 FROM backups WHERE id = ?1",
                params![backup_id.to_string()],
                row_to_backup,
            )
        })
        .await
    }

    pub async fn list_backups(&self, connection_id: Uuid, page: u32, limit: u32) -> Result<Vec<Backup>> {
        let offset = (page.saturating_sub(1) * limit) as i64;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, connection_id, database_name, status, started_at, completed_at, size_bytes, sha256, md5, error_message, logs, schedule_id
                 FROM backups WHERE connection_id = ?1 ORDER BY started_at DESC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(params![connection_id.to_string(), limit as i64, offset], row_to_backup)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn list_active_backups(&self) -> Result<Vec<Backup>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, connection_id, database_name, status, started_at, completed_at, size_bytes, sha256, md5, error_message, logs, schedule_id
                 FROM backups WHERE status = 'in_progress'",
            )?;
            let rows = stmt.query_map([], row_to_backup)?.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn list_backups_older_than(&self, connection_id: Uuid, cutoff: DateTime<Utc>) -> Result<Vec<Backup>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, connection_id, database_name, status, started_at, completed_at, size_bytes, sha256, md5, error_message, logs, schedule_id
                 FROM backups WHERE connection_id = ?1 AND status != 'in_progress' AND started_at < ?2",
            )?;
            let rows = stmt
                .query_map(params![connection_id.to_string(), cutoff.to_rfc3339()], row_to_backup)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn delete_backup(&self, backup_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM backups WHERE id = ?1", params![backup_id.to_string()])?;
            Ok(())
        })
        .await
    }

    // ---- bindings ----

    pub async fn create_binding(&self, binding: BackupProviderBinding) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backup_s3_providers (id, backup_id, provider_id, object_key, uploaded_at, size_bytes, failed, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    binding.id.to_string(),
                    binding.backup_id.to_string(),
                    binding.provider_id.to_string(),
                    binding.object_key,
                    binding.uploaded_at.to_rfc3339(),
                    binding.size_bytes as i64,
                    binding.failed,
                    binding.error_message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_bindings(&self, backup_id: Uuid) -> Result<Vec<BackupProviderBinding>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, backup_id, provider_id, object_key, uploaded_at, size_bytes, failed, error_message
                 FROM backup_s3_providers WHERE backup_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![backup_id.to_string()], row_to_binding)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    // ---- logs ----

    /// Append `lines` with contiguous line numbers starting at
    /// `max(line_number) + 1`. Caller must serialize concurrent calls for
    /// the same `backup_id` (the log bus's process-wide flush lock does
    /// this); the surrounding transaction makes the read-max/insert pair
    /// atomic against other repository consumers regardless.
    ///
    /// Falls back to a monotonic append onto the legacy `backups.logs`
    /// column when `backup_logs` itself is missing (a database opened
    /// against a pre-migration schema), so log writes keep working
    /// against an older database until it is migrated.
    pub async fn append_log(&self, backup_id: Uuid, lines: &[String]) -> Result<()> {
        let lines = lines.to_vec();
        self.with_conn(move |conn| {
            if lines.is_empty() {
                return Ok(());
            }
            match Self::append_log_lines(conn, backup_id, &lines) {
                Ok(()) => Ok(()),
                Err(e) if is_missing_backup_logs_table(&e) => Self::append_log_legacy(conn, backup_id, &lines),
                Err(e) => Err(e),
            }
        })
        .await
    }

    fn append_log_lines(conn: &Connection, backup_id: Uuid, lines: &[String]) -> rusqlite::Result<()> {
        let tx = conn.unchecked_transaction()?;
        let max: Option<i64> = tx.query_row(
            "SELECT MAX(line_number) FROM backup_logs WHERE backup_id = ?1",
            params![backup_id.to_string()],
            |row| row.get(0),
        )?;
        let mut next = max.unwrap_or(0) + 1;
        let now = Utc::now().to_rfc3339();
        for line in lines {
            tx.execute(
                "INSERT INTO backup_logs (backup_id, line_number, text, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                params![backup_id.to_string(), next, line, now],
            )?;
            next += 1;
        }
        tx.commit()
    }

    /// Monotonic single-column append: read the current `logs` text,
    /// append the new lines separated by `\n`, write it back.
    fn append_log_legacy(conn: &Connection, backup_id: Uuid, lines: &[String]) -> rusqlite::Result<()> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT logs FROM backups WHERE id = ?1",
                params![backup_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let mut combined = existing.unwrap_or_default();
        for line in lines {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(line);
        }

        conn.execute(
            "UPDATE backups SET logs = ?1 WHERE id = ?2",
            params![combined, backup_id.to_string()],
        )?;
        Ok(())
    }

    /// Prefer the line-addressed table, ordered by line number; fall back
    /// to the legacy monolithic column if no line-addressed rows exist, or
    /// if `backup_logs` itself is missing (pre-migration database).
    pub async fn get_backup_logs(&self, backup_id: Uuid) -> Result<String> {
        self.with_conn(move |conn| {
            let lines = match Self::read_backup_logs_lines(conn, backup_id) {
                Ok(lines) => lines,
                Err(e) if is_missing_backup_logs_table(&e) => Vec::new(),
                Err(e) => return Err(e),
            };

            if !lines.is_empty() {
                return Ok(lines.join("\n"));
            }

            let legacy: Option<String> = conn
                .query_row(
                    "SELECT logs FROM backups WHERE id = ?1",
                    params![backup_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            Ok(legacy.unwrap_or_default())
        })
        .await
    }

    fn read_backup_logs_lines(conn: &Connection, backup_id: Uuid) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT text FROM backup_logs WHERE backup_id = ?1 ORDER BY line_number ASC")?;
        stmt.query_map(params![backup_id.to_string()], |row| row.get::<_, String>(0))?
            .collect()
    }

    // ---- schedules ----

    pub async fn create_schedule(&self, schedule: Schedule) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backup_schedules (id, connection_id, cron_expression, sink_ids, retention_days, enabled, next_run_at, last_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    schedule.id.to_string(),
                    schedule.connection_id.to_string(),
                    schedule.cron_expression,
                    serde_json::to_string(&schedule.sink_ids).unwrap_or_default(),
                    schedule.retention_days,
                    schedule.enabled,
                    schedule.next_run_at.map(|t| t.to_rfc3339()),
                    schedule.last_run_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_enabled_schedules(&self) -> Result<Vec<Schedule>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, connection_id, cron_expression, sink_ids, retention_days, enabled, next_run_at, last_run_at
                 FROM backup_schedules WHERE enabled = 1",
            )?;
            let rows = stmt.query_map([], row_to_schedule)?.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn update_schedule(
        &self,
        connection_id: Uuid,
        cron_expression: String,
        retention_days: Option<u32>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE backup_schedules SET cron_expression = ?1, retention_days = ?2 WHERE connection_id = ?3",
                params![cron_expression, retention_days, connection_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_schedule_run_times(
        &self,
        connection_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE backup_schedules SET next_run_at = ?1, last_run_at = ?2 WHERE connection_id = ?3",
                params![
                    next_run_at.map(|t| t.to_rfc3339()),
                    last_run_at.map(|t| t.to_rfc3339()),
                    connection_id.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn disable_schedule(&self, connection_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE backup_schedules SET enabled = 0 WHERE connection_id = ?1",
                params![connection_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    // ---- share tokens ----

    pub async fn create_share_token(&self, share: ShareToken) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO shareable_links (token, backup_id, provider_id, created_at, expires_at, access_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    share.token,
                    share.backup_id.to_string(),
                    share.provider_id.map(|id| id.to_string()),
                    share.created_at.to_rfc3339(),
                    share.expires_at.to_rfc3339(),
                    share.access_count as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_share_token(&self, token: &str) -> Result<Option<ShareToken>> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT token, backup_id, provider_id, created_at, expires_at, access_count
                 FROM shareable_links WHERE token = ?1",
                params![token],
                row_to_share_token,
            )
            .optional()
        })
        .await
    }

    pub async fn increment_share_access(&self, token: &str) -> Result<()> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE shareable_links SET access_count = access_count + 1 WHERE token = ?1",
                params![token],
            )?;
            Ok(())
        })
        .await
    }
}

fn is_missing_backup_logs_table(err: &rusqlite::Error) -> bool {
    err.to_string().contains("no such table: backup_logs")
}

fn status_str(status: BackupStatus) -> &'static str {
    match status {
        BackupStatus::InProgress => "in_progress",
        BackupStatus::Success => "success",
        BackupStatus::CompletedWithErrors => "completed_with_errors",
        BackupStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> BackupStatus {
    match s {
        "success" => BackupStatus::Success,
        "completed_with_errors" => BackupStatus::CompletedWithErrors,
        "failed" => BackupStatus::Failed,
        _ => BackupStatus::InProgress,
    }
}

fn parse_uuid(s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|_| rusqlite::Error::InvalidColumnType(0, "uuid".into(), rusqlite::types::Type::Text))
}

fn parse_datetime(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

fn row_to_provider(row: &rusqlite::Row) -> rusqlite::Result<S3Provider> {
    Ok(S3Provider {
        id: parse_uuid(row.get(0)?)?,
        owner_connection_id: parse_uuid(row.get(1)?)?,
        name: row.get(2)?,
        endpoint: row.get(3)?,
        region: row.get(4)?,
        bucket: row.get(5)?,
        access_key: row.get(6)?,
        secret_key_ciphertext: row.get(7)?,
        use_tls: row.get(8)?,
        path_prefix: row.get(9)?,
        is_default: row.get(10)?,
        created_at: parse_datetime(row.get(11)?)?,
    })
}

fn row_to_backup(row: &rusqlite::Row) -> rusqlite::Result<Backup> {
    let size_bytes: Option<i64> = row.get(6)?;
    let completed_at: Option<String> = row.get(5)?;
    let schedule_id: Option<String> = row.get(11)?;
    Ok(Backup {
        id: parse_uuid(row.get(0)?)?,
        connection_id: parse_uuid(row.get(1)?)?,
        database_name: row.get(2)?,
        status: parse_status(&row.get::<_, String>(3)?),
        started_at: parse_datetime(row.get(4)?)?,
        completed_at: completed_at.map(|s| parse_datetime(s)).transpose()?,
        size_bytes: size_bytes.map(|v| v as u64),
        sha256: row.get(7)?,
        md5: row.get(8)?,
        error_message: row.get(9)?,
        logs: row.get(10)?,
        schedule_id: schedule_id.map(|s| Uuid::parse_str(&s)).transpose().map_err(|_| {
            rusqlite::Error::InvalidColumnType(11, "schedule_id".into(), rusqlite::types::Type::Text)
        })?,
    })
}

fn row_to_binding(row: &rusqlite::Row) -> rusqlite::Result<BackupProviderBinding> {
    let size_bytes: i64 = row.get(5)?;
    Ok(BackupProviderBinding {
        id: parse_uuid(row.get(0)?)?,
        backup_id: parse_uuid(row.get(1)?)?,
        provider_id: parse_uuid(row.get(2)?)?,
        object_key: row.get(3)?,
        uploaded_at: parse_datetime(row.get(4)?)?,
        size_bytes: size_bytes as u64,
        failed: row.get(6)?,
        error_message: row.get(7)?,
    })
}

fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<Schedule> {
    let sink_ids_json: String = row.get(3)?;
    let next_run_at: Option<String> = row.get(6)?;
    let last_run_at: Option<String> = row.get(7)?;
    Ok(Schedule {
        id: parse_uuid(row.get(0)?)?,
        connection_id: parse_uuid(row.get(1)?)?,
        cron_expression: row.get(2)?,
        sink_ids: serde_json::from_str(&sink_ids_json).unwrap_or_default(),
        retention_days: row.get(4)?,
        enabled: row.get(5)?,
        next_run_at: next_run_at.map(parse_datetime).transpose()?,
        last_run_at: last_run_at.map(parse_datetime).transpose()?,
    })
}

fn row_to_share_token(row: &rusqlite::Row) -> rusqlite::Result<ShareToken> {
    let provider_id: Option<String> = row.get(2)?;
    let access_count: i64 = row.get(5)?;
    Ok(ShareToken {
        token: row.get(0)?,
        backup_id: parse_uuid(row.get(1)?)?,
        provider_id: provider_id.map(|s| Uuid::parse_str(&s)).transpose().map_err(|_| {
            rusqlite::Error::InvalidColumnType(2, "provider_id".into(), rusqlite::types::Type::Text)
        })?,
        created_at: parse_datetime(row.get(3)?)?,
        expires_at: parse_datetime(row.get(4)?)?,
        access_count: access_count as u64,
    })
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS s3_providers (
    id TEXT PRIMARY KEY,
    owner_connection_id TEXT NOT NULL,
    name TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    region TEXT,
    bucket TEXT NOT NULL,
    access_key TEXT NOT NULL,
    secret_key_ciphertext BLOB NOT NULL,
    use_tls INTEGER NOT NULL,
    path_prefix TEXT,
    is_default INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backups (
    id TEXT PRIMARY KEY,
    connection_id TEXT NOT NULL,
    database_name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    size_bytes INTEGER,
    sha256 TEXT,
    md5 TEXT,
    error_message TEXT,
    logs TEXT,
    schedule_id TEXT
);

CREATE TABLE IF NOT EXISTS backup_s3_providers (
    id TEXT PRIMARY KEY,
    backup_id TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    object_key TEXT NOT NULL,
    uploaded_at TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    failed INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    UNIQUE (backup_id, provider_id)
);

CREATE TABLE IF NOT EXISTS backup_logs (
    backup_id TEXT NOT NULL,
    line_number INTEGER NOT NULL,
    text TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (backup_id, line_number)
);

CREATE TABLE IF NOT EXISTS backup_schedules (
    id TEXT PRIMARY KEY,
    connection_id TEXT NOT NULL UNIQUE,
    cron_expression TEXT NOT NULL,
    sink_ids TEXT NOT NULL,
    retention_days INTEGER,
    enabled INTEGER NOT NULL DEFAULT 1,
    next_run_at TEXT,
    last_run_at TEXT
);

CREATE TABLE IF NOT EXISTS shareable_links (
    token TEXT PRIMARY KEY,
    backup_id TEXT NOT NULL,
    provider_id TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_repo() -> Repository {
        Repository::open(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_get_backup_roundtrips() {
        let repo = test_repo().await;
        let id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        repo.create_backup(Backup {
            id,
            connection_id,
            database_name: "shop".to_string(),
            status: BackupStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            size_bytes: None,
            sha256: None,
            md5: None,
            error_message: None,
            logs: None,
            schedule_id: None,
        })
        .await
        .unwrap();

        let backup = repo.get_backup(id).await.unwrap();
        assert_eq!(backup.database_name, "shop");
        assert_eq!(backup.status, BackupStatus::InProgress);
    }

    #[tokio::test]
    async fn update_backup_never_overwrites_logs_with_empty_string() {
        let repo = test_repo().await;
        let id = Uuid::new_v4();
        repo.create_backup(Backup {
            id,
            connection_id: Uuid::new_v4(),
            database_name: "shop".to_string(),
            status: BackupStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            size_bytes: None,
            sha256: None,
            md5: None,
            error_message: None,
            logs: Some("existing logs".to_string()),
            schedule_id: None,
        })
        .await
        .unwrap();

        repo.update_backup(id, Some(BackupStatus::Success), Some(Utc::now()), None, None, None, None, Some(String::new()))
            .await
            .unwrap();

        let backup = repo.get_backup(id).await.unwrap();
        assert_eq!(backup.logs.as_deref(), Some("existing logs"));
    }

    #[tokio::test]
    async fn append_log_assigns_contiguous_line_numbers() {
        let repo = test_repo().await;
        let id = Uuid::new_v4();
        repo.append_log(id, &["first".to_string(), "second".to_string()]).await.unwrap();
        repo.append_log(id, &["third".to_string()]).await.unwrap();

        let logs = repo.get_backup_logs(id).await.unwrap();
        assert_eq!(logs, "first\nsecond\nthird");
    }

    #[tokio::test]
    async fn append_log_falls_back_to_legacy_column_without_backup_logs_table() {
        let repo = test_repo().await;
        let id = Uuid::new_v4();
        repo.create_backup(Backup {
            id,
            connection_id: Uuid::new_v4(),
            database_name: "shop".to_string(),
            status: BackupStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            size_bytes: None,
            sha256: None,
            md5: None,
            error_message: None,
            logs: None,
            schedule_id: None,
        })
        .await
        .unwrap();

        // Simulate a pre-migration database: the line-addressed table
        // doesn't exist yet.
        repo.with_conn(|conn| conn.execute_batch("DROP TABLE backup_logs")).await.unwrap();

        repo.append_log(id, &["first".to_string(), "second".to_string()]).await.unwrap();
        repo.append_log(id, &["third".to_string()]).await.unwrap();

        let logs = repo.get_backup_logs(id).await.unwrap();
        assert_eq!(logs, "first\nsecond\nthird");
    }

    #[tokio::test]
    async fn set_default_provider_is_exclusive() {
        let repo = test_repo().await;
        let owner = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        for (id, is_default) in [(a, true), (b, false)] {
            repo.create_provider(S3Provider {
                id,
                owner_connection_id: owner,
                name: "p".to_string(),
                endpoint: "https://example.com".to_string(),
                region: None,
                bucket: "b".to_string(),
                access_key: "ak".to_string(),
                secret_key_ciphertext: vec![],
                use_tls: true,
                path_prefix: None,
                is_default,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        repo.set_default_provider(owner, b).await.unwrap();
        let providers = repo.list_providers(owner).await.unwrap();
        assert_eq!(providers.iter().filter(|p| p.is_default).count(), 1);
        assert!(providers.iter().find(|p| p.id == b).unwrap().is_default);
    }
}
