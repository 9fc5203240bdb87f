//! Backup Coordinator (§4.6): orchestrates one backup end to end and owns
//! its status transitions.
//!
//! `start_backup` returns immediately after durably creating the `Backup`
//! row and allocating a log channel; the 9-step run pipeline proceeds on a
//! spawned task. The terminal state machine is exactly:
//!
//! ```text
//! in_progress ──subprocess ok & N==0 ─────────────────────► success
//! in_progress ──subprocess ok & k==N, N>0 ────────────────► success
//! in_progress ──subprocess ok & 0<k<N ────────────────────► completed_with_errors
//! in_progress ──subprocess ok & k==0, N>0 ────────────────► completed_with_errors
//! in_progress ──subprocess err OR pipeline err ──────────► failed
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::dump::{self, ConnectionInfo, DbEngine, DumpTarget};
use crate::error::{BackupError, Result};
use crate::logbus::LogBus;
use crate::model::{Backup, BackupProviderBinding, BackupStatus};
use crate::notify::{BackupEvent, ConnectionRegistry, Notifier, SettingsProvider};
use crate::repository::Repository;
use crate::storage::s3;
use crate::storage::{self, ObjectStoreClient, ObjectStoreConfig};
use crate::upload::{self, Sink};

/// Shared dependencies plus run-tracking state for every active backup.
pub struct Coordinator {
    repository: Arc<Repository>,
    log_bus: Arc<LogBus>,
    connections: Arc<dyn ConnectionRegistry>,
    settings: Arc<dyn SettingsProvider>,
    notifier: Arc<dyn Notifier>,
    staging_root: PathBuf,
    active_connections: Mutex<HashSet<Uuid>>,
    completions: Mutex<std::collections::HashMap<Uuid, Arc<Notify>>>,
    subprocess_pids: Mutex<std::collections::HashMap<Uuid, u32>>,
}

impl Coordinator {
    pub fn new(
        repository: Arc<Repository>,
        log_bus: Arc<LogBus>,
        connections: Arc<dyn ConnectionRegistry>,
        settings: Arc<dyn SettingsProvider>,
        notifier: Arc<dyn Notifier>,
        staging_root: PathBuf,
    ) -> Self {
        Self {
            repository,
            log_bus,
            connections,
            settings,
            notifier,
            staging_root,
            active_connections: Mutex::new(HashSet::new()),
            completions: Mutex::new(std::collections::HashMap::new()),
            subprocess_pids: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Terminate a running backup's subprocess (SIGTERM, then SIGKILL
    /// after a grace period if it hasn't exited) and mark the backup
    /// `failed` with reason `Canceled`, per §5's cancellation contract.
    pub async fn cancel_backup(&self, backup_id: Uuid) -> Result<()> {
        let pid = self.subprocess_pids.lock().await.get(&backup_id).copied();
        if let Some(pid) = pid {
            terminate_pid(pid).await;
        }
        self.repository
            .update_backup(
                backup_id,
                Some(BackupStatus::Failed),
                Some(Utc::now()),
                None,
                None,
                None,
                Some(BackupError::Canceled("canceled by request".to_string()).to_string()),
                None,
            )
            .await
    }

    /// Public contract: returns immediately after durably creating the
    /// `Backup` row in `in_progress` and allocating a log channel. The run
    /// proceeds asynchronously on a spawned task.
    pub async fn start_backup(
        self: &Arc<Self>,
        connection_id: Uuid,
        sink_ids: Option<Vec<Uuid>>,
        schedule_id: Option<Uuid>,
    ) -> Result<(Uuid, DateTime<Utc>)> {
        {
            let mut active = self.active_connections.lock().await;
            if !active.insert(connection_id) {
                return Err(BackupError::InvalidState(format!(
                    "connection {connection_id} already has a backup in progress"
                )));
            }
        }

        let connection = match self.connections.get_connection(connection_id).await {
            Ok(c) => c,
            Err(e) => {
                self.active_connections.lock().await.remove(&connection_id);
                return Err(e);
            }
        };

        let backup_id = Uuid::new_v4();
        let accepted_at = Utc::now();

        self.repository
            .create_backup(Backup {
                id: backup_id,
                connection_id,
                database_name: connection.database_name.clone(),
                status: BackupStatus::InProgress,
                started_at: accepted_at,
                completed_at: None,
                size_bytes: None,
                sha256: None,
                md5: None,
                error_message: None,
                logs: None,
                schedule_id,
            })
            .await?;

        self.log_bus.open_channel(backup_id).await;
        self.log_bus.spawn_timer(backup_id);
        self.completions.lock().await.insert(backup_id, Arc::new(Notify::new()));

        let coordinator = self.clone();
        let sink_ids = sink_ids;
        tokio::spawn(async move {
            coordinator.run(backup_id, connection_id, connection, sink_ids).await;
        });

        Ok((backup_id, accepted_at))
    }

    /// Block until `backup_id` reaches a terminal state.
    pub async fn wait_for_terminal(&self, backup_id: Uuid) -> Result<()> {
        let notify = {
            let completions = self.completions.lock().await;
            completions.get(&backup_id).cloned()
        };
        if let Some(notify) = notify {
            notify.notified().await;
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, backup_id: Uuid, connection_id: Uuid, connection: ConnectionInfo, sink_ids: Option<Vec<Uuid>>) {
        let result = self.run_pipeline(backup_id, connection_id, &connection, sink_ids).await;

        match result {
            Ok(terminal_event) => {
                self.notifier.notify(terminal_event).await;
            }
            Err(e) => {
                let _ = self
                    .repository
                    .update_backup(backup_id, Some(BackupStatus::Failed), Some(Utc::now()), None, None, None, Some(e.to_string()), None)
                    .await;
                self.notifier
                    .notify(BackupEvent::Failed {
                        backup_id,
                        connection_id,
                        reason: e.to_string(),
                    })
                    .await;
            }
        }

        self.active_connections.lock().await.remove(&connection_id);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        self.log_bus.close_channel(backup_id).await;

        if let Some(notify) = self.completions.lock().await.remove(&backup_id) {
            notify.notify_waiters();
        }
    }

    async fn run_pipeline(
        &self,
        backup_id: Uuid,
        connection_id: Uuid,
        connection: &ConnectionInfo,
        sink_ids: Option<Vec<Uuid>>,
    ) -> Result<BackupEvent> {
        // Step 2: resolve sink list.
        let sinks = self.resolve_sinks(connection_id, sink_ids).await?;

        // Step 3: opening log lines.
        self.log_bus.emit(backup_id, format!("engine: {:?}", connection.engine)).await;
        self.log_bus.emit(backup_id, format!("target: {}@{}:{}", connection.username, connection.host, connection.port)).await;
        self.log_bus.emit(backup_id, format!("database: {}", connection.database_name)).await;

        if connection.engine == DbEngine::Postgresql {
            let probe = dump::probe_postgres(connection, &connection.host, connection.port).await;
            if let Some(client) = &probe.client_version {
                self.log_bus.emit(backup_id, format!("pg_dump client version: {client}")).await;
            }
            if let (Some(client), Some(server)) = (&probe.client_version, &probe.server_version) {
                if let (Some(cv), Some(sv)) = (dump::major_version(client), dump::major_version(server)) {
                    if cv != sv {
                        self.log_bus
                            .emit(backup_id, format!("[VersionMismatchWarning] client major {cv} != server major {sv}"))
                            .await;
                    }
                }
            }
            if probe.has_timescaledb {
                self.log_bus.emit(backup_id, "detected extension: timescaledb".to_string()).await;
            }
        }

        // Step 4: streaming vs file mode.
        let streaming = connection.engine.supports_streaming() && !sinks.is_empty();

        let folder = upload::sanitize_connection_name(&connection.username);
        let filename = format!("{}_{}", connection.database_name, Utc::now().format("%Y%m%d_%H%M%S"));

        let fan_out = if streaming {
            self.run_streaming(backup_id, connection, &folder, &filename, &sinks).await?
        } else {
            self.run_file_mode(backup_id, connection, &folder, &filename, &sinks).await?
        };

        // Step 7/8: persist bindings, determine terminal status.
        let succeeded = fan_out.succeeded_count();
        let total = fan_out.outcomes.len();

        for outcome in &fan_out.outcomes {
            if outcome.succeeded() {
                self.repository
                    .create_binding(BackupProviderBinding {
                        id: Uuid::new_v4(),
                        backup_id,
                        provider_id: outcome.provider_id,
                        object_key: outcome.object_key.clone(),
                        uploaded_at: Utc::now(),
                        size_bytes: fan_out.size_bytes,
                        failed: false,
                        error_message: None,
                    })
                    .await?;
            }
        }

        let classification = fan_out.classify();
        let status = match &classification {
            Ok(()) => BackupStatus::Success,
            Err(_) if succeeded > 0 => BackupStatus::CompletedWithErrors,
            Err(_) => BackupStatus::Failed,
        };

        if let Err(e) = &classification {
            self.log_bus.emit(backup_id, e.to_string()).await;
        }

        self.repository
            .update_backup(
                backup_id,
                Some(status),
                Some(Utc::now()),
                Some(fan_out.size_bytes),
                Some(fan_out.sha256.clone()),
                Some(fan_out.md5.clone()),
                classification.as_ref().err().map(|e| e.to_string()),
                None,
            )
            .await?;

        let event = match status {
            BackupStatus::Success => BackupEvent::Success { backup_id, connection_id },
            BackupStatus::CompletedWithErrors => BackupEvent::CompletedWithErrors {
                backup_id,
                connection_id,
                error_count: total - succeeded,
            },
            _ => BackupEvent::Failed {
                backup_id,
                connection_id,
                reason: classification.err().map(|e| e.to_string()).unwrap_or_default(),
            },
        };

        Ok(event)
    }

    async fn run_streaming(
        &self,
        backup_id: Uuid,
        connection: &ConnectionInfo,
        folder: &str,
        filename: &str,
        sinks: &[Sink],
    ) -> Result<upload::FanOutResult> {
        let mut handle = dump::spawn_dump(connection, DumpTarget::Stdout).await?;
        if let Some(pid) = handle.child.id() {
            self.subprocess_pids.lock().await.insert(backup_id, pid);
        }
        let stdout = handle.stdout.take().ok_or_else(|| BackupError::SubprocessFailed("no stdout pipe".to_string()))?;

        let log_bus = self.log_bus.clone();
        let on_log: Box<dyn Fn(String) + Send + Sync> = Box::new(move |line| {
            log_bus.emit_blocking(backup_id, line);
        });

        let fan_out_future = upload::fan_out_streaming(stdout, folder, filename, sinks, on_log.as_ref());

        // The waiter (below) may only declare completion once both the
        // stdout reader (via fan_out_future) and this stderr reader have
        // reached EOF.
        let stderr_backup_id = backup_id;
        let log_bus_stderr = self.log_bus.clone();
        let stderr_task = tokio::spawn(async move {
            let mut version_mismatch = None;
            let last_line = handle
                .drain_stderr(|line| {
                    log_bus_stderr.emit_blocking(stderr_backup_id, line.to_string());
                    if dump::is_version_mismatch_line(line) {
                        version_mismatch = Some(line.to_string());
                    }
                })
                .await;
            (handle, last_line, version_mismatch)
        });

        let fan_out = fan_out_future.await?;

        let (mut handle, last_line, version_mismatch) = stderr_task
            .await
            .map_err(|e| BackupError::SubprocessFailed(e.to_string()))?;

        let exit_status = handle
            .child
            .wait()
            .await
            .map_err(|e| BackupError::SubprocessFailed(e.to_string()))?;

        self.subprocess_pids.lock().await.remove(&backup_id);

        if !exit_status.success() {
            if let Some(line) = version_mismatch {
                return Err(BackupError::VersionMismatchError(line));
            }
            return Err(BackupError::SubprocessFailed(format!(
                "dump subprocess exited with {exit_status}: {}",
                last_line.unwrap_or_else(|| "no stderr output".to_string())
            )));
        }

        Ok(fan_out)
    }

    async fn run_file_mode(
        &self,
        backup_id: Uuid,
        connection: &ConnectionInfo,
        folder: &str,
        filename: &str,
        sinks: &[Sink],
    ) -> Result<upload::FanOutResult> {
        let staging_dir = self.staging_root.join(folder);
        tokio::fs::create_dir_all(&staging_dir).await?;

        let target_path = if connection.engine == DbEngine::Mongodb {
            staging_dir.join(filename)
        } else {
            staging_dir.join(format!("{filename}.sql"))
        };

        let mut handle = dump::spawn_dump(connection, DumpTarget::File(target_path.clone())).await?;
        if let Some(pid) = handle.child.id() {
            self.subprocess_pids.lock().await.insert(backup_id, pid);
        }

        let log_bus_stderr = self.log_bus.clone();
        let stderr_backup_id = backup_id;
        let last_line = handle
            .drain_stderr(|line| {
                log_bus_stderr.emit_blocking(stderr_backup_id, line.to_string());
            })
            .await;

        let exit_status = handle
            .child
            .wait()
            .await
            .map_err(|e| BackupError::SubprocessFailed(e.to_string()))?;

        self.subprocess_pids.lock().await.remove(&backup_id);

        if !exit_status.success() {
            return Err(BackupError::SubprocessFailed(format!(
                "dump subprocess exited with {exit_status}: {}",
                last_line.unwrap_or_else(|| "no stderr output".to_string())
            )));
        }

        let object_key = format!("{folder}/{filename}");
        let fan_out = upload::fan_out_file(&target_path, &object_key, sinks).await?;

        if fan_out.succeeded_count() > 0 {
            if target_path.is_dir() {
                let _ = tokio::fs::remove_dir_all(&target_path).await;
            } else {
                let _ = tokio::fs::remove_file(&target_path).await;
            }
        }

        Ok(fan_out)
    }

    /// Step 2: explicit `sink_ids`, else every provider for the owner,
    /// else the owner's default provider, else zero sinks.
    async fn resolve_sinks(&self, connection_id: Uuid, sink_ids: Option<Vec<Uuid>>) -> Result<Vec<Sink>> {
        let providers = match sink_ids {
            Some(ids) if !ids.is_empty() => {
                let mut resolved = Vec::with_capacity(ids.len());
                for id in ids {
                    resolved.push(self.settings.get_provider(id).await?);
                }
                resolved
            }
            _ => {
                let all = self.settings.list_providers(connection_id).await.unwrap_or_default();
                if !all.is_empty() {
                    all
                } else {
                    match self.settings.get_default_provider(connection_id).await {
                        Ok(p) => vec![p],
                        Err(_) => Vec::new(),
                    }
                }
            }
        };

        let mut sinks = Vec::with_capacity(providers.len());
        for provider in providers {
            let provider_id = provider.id;
            let client = self.connect_provider(provider).await?;
            sinks.push(Sink {
                provider_id,
                client: Arc::new(client),
            });
        }
        Ok(sinks)
    }

    async fn connect_provider(&self, provider: crate::model::S3Provider) -> Result<s3::S3Backend> {
        let secret = self.settings.decrypt(&provider.secret_key_ciphertext).await?;
        let client = storage::connect(ObjectStoreConfig {
            endpoint: provider.endpoint,
            region: provider.region,
            bucket: provider.bucket,
            access_key: provider.access_key,
            secret_key: secret,
            use_tls: provider.use_tls,
            path_prefix: provider.path_prefix,
        })
        .await?;
        Ok(client)
    }

    /// Best-effort remove a single stored object by provider id, used by
    /// the Schedule Manager's run-end retention sweep. Failures are not
    /// propagated beyond a `Result` the caller may choose to ignore.
    pub async fn remove_object(&self, provider_id: Uuid, key: &str) -> Result<()> {
        let provider = self.settings.get_provider(provider_id).await?;
        let client = self.connect_provider(provider).await?;
        client.remove_object(key).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn terminate_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    if kill(target, Signal::SIGTERM).is_err() {
        return;
    }

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;

    if kill(target, None).is_ok() {
        let _ = kill(target, Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn terminate_pid(_pid: u32) {}
