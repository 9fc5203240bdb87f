//! Restore (Open Question i): mirrors the backup pipeline in reverse.
//!
//! Download the recorded binding's object, gunzip it if the key ends in
//! `.gz`, verify the plaintext against the backup's recorded SHA-256
//! (default on, disableable only for a deliberately partial restore), and
//! hand the stream to the engine's restore tool over stdin.

use async_compression::tokio::bufread::GzipDecoder;
use sha2::{Digest, Sha256};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use crate::dump::{self, ConnectionInfo, DbEngine};
use crate::error::{BackupError, Result};
use crate::notify::SettingsProvider;
use crate::repository::Repository;
use crate::storage::{self, ObjectStoreClient, ObjectStoreConfig};

/// Options controlling one restore run.
pub struct RestoreOptions {
    /// Restrict the download to a specific binding's provider; `None`
    /// picks the first recorded binding.
    pub provider_id: Option<Uuid>,
    /// Verify the downloaded plaintext against the backup's recorded
    /// SHA-256 before handing it to the restore tool. Default `true`;
    /// set `false` only to force a restore from a backup row whose
    /// checksum is known stale.
    pub verify_checksum: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            provider_id: None,
            verify_checksum: true,
        }
    }
}

/// Restore `backup_id` into the database described by `connection`,
/// downloading from whichever provider `options.provider_id` selects (or
/// the first recorded binding), decompressing, optionally verifying, and
/// piping the result into the engine's restore tool.
pub async fn restore_backup(
    repository: &Repository,
    settings: &dyn SettingsProvider,
    connection: &ConnectionInfo,
    backup_id: Uuid,
    options: RestoreOptions,
) -> Result<()> {
    let backup = repository.get_backup(backup_id).await?;
    let bindings = repository.list_bindings(backup_id).await?;

    let binding = match options.provider_id {
        Some(provider_id) => bindings
            .into_iter()
            .find(|b| b.provider_id == provider_id)
            .ok_or_else(|| BackupError::NotFound(format!("no binding for provider {provider_id}")))?,
        None => bindings
            .into_iter()
            .find(|b| !b.failed)
            .ok_or_else(|| BackupError::NotFound("no successful binding recorded for this backup".to_string()))?,
    };

    let provider = settings.get_provider(binding.provider_id).await?;
    let secret = settings.decrypt(&provider.secret_key_ciphertext).await?;

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

    let raw = client.get_object(&binding.object_key).await?;

    let plaintext: Box<dyn AsyncRead + Send + Unpin> = if binding.object_key.ends_with(".gz") {
        Box::new(GzipDecoder::new(BufReader::new(raw)))
    } else {
        Box::new(raw)
    };

    let plaintext = if options.verify_checksum {
        Box::new(VerifyingReader::new(plaintext, backup.sha256.clone())) as Box<dyn AsyncRead + Send + Unpin>
    } else {
        plaintext
    };

    run_restore_tool(connection, plaintext).await
}

/// Pipe `source` into the restore tool appropriate for `conn.engine`,
/// authenticating the same way the dump side does.
async fn run_restore_tool(conn: &ConnectionInfo, mut source: Box<dyn AsyncRead + Send + Unpin>) -> Result<()> {
    let (tool_name, args) = restore_profile(conn);
    let tool = dump::resolve_tool_path(tool_name)?;

    let mut command = Command::new(&tool);
    command
        .args(&args)
        .env(dump::password_env_var(conn.engine), &conn.secret)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| BackupError::SubprocessFailed(format!("failed to start {}: {e}", tool.display())))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| BackupError::SubprocessFailed("no stdin pipe".to_string()))?;

    let copy_result = {
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = match source.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            };
            if let Err(e) = stdin.write_all(&buf[..n]).await {
                break Err(e);
            }
        }
    };
    drop(stdin);
    copy_result?;

    let status = child.wait().await.map_err(|e| BackupError::SubprocessFailed(e.to_string()))?;
    if !status.success() {
        return Err(BackupError::SubprocessFailed(format!("restore tool exited with {status}")));
    }
    Ok(())
}

fn restore_profile(conn: &ConnectionInfo) -> (&'static str, Vec<std::ffi::OsString>) {
    let mut args: Vec<std::ffi::OsString> = Vec::new();
    let tool: &'static str = match conn.engine {
        DbEngine::Postgresql => {
            args.push("--host".into());
            args.push(conn.host.clone().into());
            args.push("--port".into());
            args.push(conn.port.to_string().into());
            args.push("--username".into());
            args.push(conn.username.clone().into());
            args.push(conn.database_name.clone().into());
            "psql"
        }
        DbEngine::Mysql | DbEngine::MariaDb => {
            args.push("--host".into());
            args.push(conn.host.clone().into());
            args.push("--port".into());
            args.push(conn.port.to_string().into());
            args.push("--user".into());
            args.push(conn.username.clone().into());
            args.push(conn.database_name.clone().into());
            "mysql"
        }
        DbEngine::Mongodb => {
            args.push("--host".into());
            args.push(conn.host.clone().into());
            args.push("--port".into());
            args.push(conn.port.to_string().into());
            args.push("--username".into());
            args.push(conn.username.clone().into());
            args.push("--db".into());
            args.push(conn.database_name.clone().into());
            args.push("--archive".into());
            "mongorestore"
        }
        DbEngine::Redis => {
            args.push("-h".into());
            args.push(conn.host.clone().into());
            args.push("-p".into());
            args.push(conn.port.to_string().into());
            args.push("--pipe".into());
            "redis-cli"
        }
    };
    (tool, args)
}

/// An `AsyncRead` that hashes everything passed through it and compares
/// the final digest against an expected value once EOF is reached,
/// failing the *next* read past EOF rather than silently truncating.
struct VerifyingReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    hasher: Sha256,
    expected: Option<String>,
    done: bool,
}

impl VerifyingReader {
    fn new(inner: Box<dyn AsyncRead + Send + Unpin>, expected: Option<String>) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            expected,
            done: false,
        }
    }
}

impl AsyncRead for VerifyingReader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = std::pin::Pin::new(&mut self.inner).poll_read(cx, buf);
        if let std::task::Poll::Ready(Ok(())) = &poll {
            let new_bytes = &buf.filled()[before..];
            if new_bytes.is_empty() && !self.done {
                self.done = true;
                if let Some(expected) = &self.expected {
                    let actual = format!("{:x}", self.hasher.clone().finalize());
                    if !actual.eq_ignore_ascii_case(expected) {
                        return std::task::Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("checksum mismatch: expected {expected}, got {actual}"),
                        )));
                    }
                }
            } else {
                self.hasher.update(new_bytes);
            }
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_options_default_verifies_by_default() {
        assert!(RestoreOptions::default().verify_checksum);
    }

    #[test]
    fn restore_profile_picks_psql_for_postgresql() {
        let conn = ConnectionInfo {
            engine: DbEngine::Postgresql,
            host: "db.internal".to_string(),
            port: 5432,
            username: "app".to_string(),
            secret: "s".to_string(),
            database_name: "shop".to_string(),
            ssh_tunnel: None,
        };
        let (tool, _) = restore_profile(&conn);
        assert_eq!(tool, "psql");
    }

    #[test]
    fn restore_profile_picks_redis_cli_pipe_for_redis() {
        let conn = ConnectionInfo {
            engine: DbEngine::Redis,
            host: "cache.internal".to_string(),
            port: 6379,
            username: String::new(),
            secret: "s".to_string(),
            database_name: String::new(),
            ssh_tunnel: None,
        };
        let (tool, args) = restore_profile(&conn);
        assert_eq!(tool, "redis-cli");
        assert!(args.iter().any(|a| a == "--pipe"));
    }
}
