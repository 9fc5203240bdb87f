//! Per-engine dump subprocess supervision.
//!
//! Each [`DbEngine`] maps to a single dump tool. The driver resolves that
//! tool's absolute path, builds its argument profile, optionally tunnels
//! the connection over SSH, and supervises the subprocess with three
//! cooperating workers: a stdout reader, a stderr reader, and a waiter
//! that may only declare completion once both readers have returned EOF.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::{BackupError, Result};

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbEngine {
    Postgresql,
    Mysql,
    MariaDb,
    Mongodb,
    Redis,
}

impl DbEngine {
    /// Whether this engine's dump tool can stream its output on stdout.
    /// Mongo and Redis dump tools write to a target directory/file and
    /// cannot be piped, so they require file mode.
    pub fn supports_streaming(self) -> bool {
        matches!(self, DbEngine::Postgresql | DbEngine::Mysql | DbEngine::MariaDb)
    }

    fn tool_name(self) -> &'static str {
        match self {
            DbEngine::Postgresql => "pg_dump",
            DbEngine::Mysql | DbEngine::MariaDb => "mysqldump",
            DbEngine::Mongodb => "mongodump",
            DbEngine::Redis => "redis-cli",
        }
    }
}

/// SSH tunnel authentication.
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKeyPath(PathBuf),
}

/// SSH tunnel configuration attached to a connection.
#[derive(Debug, Clone)]
pub struct SshTunnelConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

/// The remote database connection a dump run targets.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub engine: DbEngine,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub database_name: String,
    pub ssh_tunnel: Option<SshTunnelConfig>,
}

/// Where the subprocess's stdout should go.
pub enum DumpTarget {
    /// Streaming mode: stdout is piped to the caller.
    Stdout,
    /// File mode: the tool writes directly to `path` (or, for mongodump,
    /// a directory).
    File(PathBuf),
}

/// A running dump subprocess plus its effective (possibly tunneled)
/// connection endpoint.
pub struct DumpHandle {
    pub child: Child,
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    stderr_rx: mpsc::Receiver<String>,
    _tunnel: Option<SshTunnel>,
}

impl DumpHandle {
    /// Drain the stderr line channel, forwarding every line to `on_line`.
    /// Returns the last line seen, used as a failure summary.
    pub async fn drain_stderr(&mut self, mut on_line: impl FnMut(&str)) -> Option<String> {
        let mut last = None;
        while let Some(line) = self.stderr_rx.recv().await {
            on_line(&line);
            last = Some(line);
        }
        last
    }
}

/// An established SSH local port forward. Torn down on drop.
pub struct SshTunnel {
    local_port: u16,
    _session: openssh::Session,
}

impl SshTunnel {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

/// Open a local port forward to `target_host:target_port` through the
/// given tunnel configuration, returning a handle bound to an ephemeral
/// local port. Torn down on any exit path via `Drop`.
pub async fn open_tunnel(cfg: &SshTunnelConfig, target_host: &str, target_port: u16) -> Result<SshTunnel> {
    use openssh::{KnownHosts, Session, SessionBuilder};

    let mut builder = SessionBuilder::default();
    builder.user(cfg.username.clone()).port(cfg.port);
    if let SshAuth::PrivateKeyPath(path) = &cfg.auth {
        builder.keyfile(path);
    }

    let session = builder
        .known_hosts_check(KnownHosts::Accept)
        .connect_mux(&cfg.host)
        .await
        .map_err(|e| BackupError::TunnelSetupFailed(e.to_string()))?;

    let local_port = pick_ephemeral_port().await?;
    let local = std::net::SocketAddr::from(([127, 0, 0, 1], local_port));
    let remote: std::net::SocketAddr = format!("{target_host}:{target_port}")
        .parse()
        .map_err(|e: std::net::AddrParseError| BackupError::TunnelSetupFailed(e.to_string()))?;

    session
        .request_port_forward(openssh::ForwardType::Local, local, remote)
        .await
        .map_err(|e| BackupError::TunnelSetupFailed(e.to_string()))?;

    Ok(SshTunnel {
        local_port,
        _session: session,
    })
}

async fn pick_ephemeral_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Directories searched for platform-versioned tool installs, newest
/// version first within each root.
fn platform_versioned_roots(tool: &str) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if tool == "pg_dump" {
        if let Ok(entries) = std::fs::read_dir("/usr/lib/postgresql") {
            let mut versions: Vec<_> = entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter_map(|name| name.parse::<u32>().ok().map(|v| (v, name)))
                .collect();
            versions.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, name) in versions {
                roots.push(PathBuf::from("/usr/lib/postgresql").join(name).join("bin"));
            }
        }
    }
    roots
}

/// Generic install roots checked after platform-versioned roots.
fn generic_roots() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/usr/bin"),
        PathBuf::from("/opt/homebrew/bin"),
    ]
}

/// Resolve the absolute path of a dump tool: platform-versioned install
/// roots (descending version), then generic install roots, then `PATH`.
pub fn resolve_tool_path(tool: &str) -> Result<PathBuf> {
    for root in platform_versioned_roots(tool) {
        let candidate = root.join(tool);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    for root in generic_roots() {
        let candidate = root.join(tool);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(tool);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(BackupError::ToolMissing(tool.to_string()))
}

/// Build the argument profile for one engine per §4.4's table.
fn build_args(engine: DbEngine, conn: &ConnectionInfo, host: &str, port: u16, target: &DumpTarget) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    match engine {
        DbEngine::Postgresql => {
            args.push("--host".into());
            args.push(host.into());
            args.push("--port".into());
            args.push(port.to_string().into());
            args.push("--username".into());
            args.push(conn.username.clone().into());
            args.push("--no-owner".into());
            args.push("--no-privileges".into());
            args.push("--verbose".into());
            if let DumpTarget::File(path) = target {
                args.push("--file".into());
                args.push(path.into());
            }
            args.push(conn.database_name.clone().into());
        }
        DbEngine::Mysql | DbEngine::MariaDb => {
            args.push("--host".into());
            args.push(host.into());
            args.push("--port".into());
            args.push(port.to_string().into());
            args.push("--user".into());
            args.push(conn.username.clone().into());
            args.push("--single-transaction".into());
            args.push("--quick".into());
            args.push("--lock-tables=false".into());
            args.push("--routines".into());
            args.push("--triggers".into());
            args.push("--events".into());
            if let DumpTarget::File(path) = target {
                args.push(format!("--result-file={}", path.display()).into());
            }
            args.push(conn.database_name.clone().into());
        }
        DbEngine::Mongodb => {
            args.push("--host".into());
            args.push(host.into());
            args.push("--port".into());
            args.push(port.to_string().into());
            args.push("--username".into());
            args.push(conn.username.clone().into());
            args.push("--db".into());
            args.push(conn.database_name.clone().into());
            if let DumpTarget::File(path) = target {
                args.push("--out".into());
                args.push(path.into());
            }
        }
        DbEngine::Redis => {
            args.push("-h".into());
            args.push(host.into());
            args.push("-p".into());
            args.push(port.to_string().into());
            if let DumpTarget::File(path) = target {
                args.push("--rdb".into());
                args.push(path.into());
            }
        }
    }
    args
}

pub(crate) fn password_env_var(engine: DbEngine) -> &'static str {
    match engine {
        DbEngine::Postgresql => "PGPASSWORD",
        DbEngine::Mysql | DbEngine::MariaDb => "MYSQL_PWD",
        DbEngine::Mongodb => "MONGO_PASSWORD",
        DbEngine::Redis => "REDISCLI_AUTH",
    }
}

static VERSION_MISMATCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)server version mismatch|aborting because of server version mismatch").unwrap()
});

/// Does a stderr line indicate a PostgreSQL client/server version mismatch?
pub fn is_version_mismatch_line(line: &str) -> bool {
    VERSION_MISMATCH_RE.is_match(line)
}

/// Launch the dump subprocess for `conn`, tunneling through SSH first if
/// configured. `target` selects streaming vs. file mode; callers must not
/// request `DumpTarget::Stdout` for an engine where
/// [`DbEngine::supports_streaming`] is false.
pub async fn spawn_dump(conn: &ConnectionInfo, target: DumpTarget) -> Result<DumpHandle> {
    if matches!(target, DumpTarget::Stdout) && !conn.engine.supports_streaming() {
        return Err(BackupError::SubprocessFailed(
            "file mode required for this engine".to_string(),
        ));
    }

    let tool = resolve_tool_path(conn.engine.tool_name())?;

    let tunnel = if let Some(ssh) = &conn.ssh_tunnel {
        Some(open_tunnel(ssh, &conn.host, conn.port).await?)
    } else {
        None
    };

    let (effective_host, effective_port) = match &tunnel {
        Some(t) => ("127.0.0.1".to_string(), t.local_port()),
        None => (conn.host.clone(), conn.port),
    };

    let args = build_args(conn.engine, conn, &effective_host, effective_port, &target);

    let mut command = Command::new(&tool);
    command
        .args(&args)
        .env(password_env_var(conn.engine), &conn.secret)
        .stdin(Stdio::null())
        .stderr(Stdio::piped());

    command.stdout(match target {
        DumpTarget::Stdout => Stdio::piped(),
        DumpTarget::File(_) => Stdio::null(),
    });

    let mut child = command
        .spawn()
        .map_err(|e| BackupError::SubprocessFailed(format!("failed to start {}: {e}", tool.display())))?;

    let stdout: Option<Box<dyn AsyncRead + Send + Unpin>> = match target {
        DumpTarget::Stdout => child.stdout.take().map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
        DumpTarget::File(_) => None,
    };

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BackupError::SubprocessFailed("no stderr pipe".to_string()))?;

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });

    Ok(DumpHandle {
        child,
        stdout,
        stderr_rx: rx,
        _tunnel: tunnel,
    })
}

/// Result of probing a PostgreSQL server via `psql` ahead of the dump.
#[derive(Debug, Clone, Default)]
pub struct PostgresProbe {
    pub client_version: Option<String>,
    pub server_version: Option<String>,
    pub has_timescaledb: bool,
}

/// Run a `psql` probe to capture the server `version()` and detect the
/// `timescaledb` extension. Emits a `VersionMismatchWarning`-worthy
/// mismatch as a boolean the caller logs; never fails the backup itself.
pub async fn probe_postgres(conn: &ConnectionInfo, host: &str, port: u16) -> PostgresProbe {
    let mut probe = PostgresProbe::default();

    if let Ok(psql) = resolve_tool_path("psql") {
        if let Ok(output) = Command::new(&psql).arg("--version").output().await {
            probe.client_version = Some(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let conn_args = [
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--username".to_string(),
            conn.username.clone(),
            "--dbname".to_string(),
            conn.database_name.clone(),
            "--tuples-only".to_string(),
            "--no-align".to_string(),
        ];

        if let Ok(output) = Command::new(&psql)
            .args(&conn_args)
            .arg("-c")
            .arg("select version()")
            .env("PGPASSWORD", &conn.secret)
            .output()
            .await
        {
            probe.server_version = Some(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        if let Ok(output) = Command::new(&psql)
            .args(&conn_args)
            .arg("-c")
            .arg("select extname from pg_extension where extname = 'timescaledb'")
            .env("PGPASSWORD", &conn.secret)
            .output()
            .await
        {
            probe.has_timescaledb = String::from_utf8_lossy(&output.stdout).contains("timescaledb");
        }
    }

    probe
}

/// Extract a PostgreSQL major version number (`"16.2"` → `16`) from a
/// version string such as `psql (PostgreSQL) 16.2` or the server's
/// `PostgreSQL 15.4 on x86_64-pc-linux-gnu...`.
pub fn major_version(version_string: &str) -> Option<u32> {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\.\d+").unwrap());
    RE.captures(version_string)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Static map from engine to tool name, for log lines and diagnostics.
pub fn tool_map() -> HashMap<DbEngine, &'static str> {
    [
        (DbEngine::Postgresql, "pg_dump"),
        (DbEngine::Mysql, "mysqldump"),
        (DbEngine::MariaDb, "mysqldump"),
        (DbEngine::Mongodb, "mongodump"),
        (DbEngine::Redis, "redis-cli"),
    ]
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_support_matches_spec_table() {
        assert!(DbEngine::Postgresql.supports_streaming());
        assert!(DbEngine::Mysql.supports_streaming());
        assert!(DbEngine::MariaDb.supports_streaming());
        assert!(!DbEngine::Mongodb.supports_streaming());
        assert!(!DbEngine::Redis.supports_streaming());
    }

    #[test]
    fn version_mismatch_regex_matches_known_phrasings() {
        assert!(is_version_mismatch_line("pg_dump: error: aborting because of server version mismatch"));
        assert!(is_version_mismatch_line("FATAL: server version mismatch detected"));
        assert!(!is_version_mismatch_line("pg_dump: dumping contents of table \"users\""));
    }

    #[test]
    fn major_version_extracts_leading_number() {
        assert_eq!(major_version("psql (PostgreSQL) 16.2"), Some(16));
        assert_eq!(major_version("PostgreSQL 15.4 on x86_64-pc-linux-gnu"), Some(15));
        assert_eq!(major_version("not a version"), None);
    }

    #[test]
    fn resolve_tool_path_fails_for_unknown_tool() {
        let err = resolve_tool_path("definitely-not-a-real-dump-tool-binary").unwrap_err();
        assert!(matches!(err, BackupError::ToolMissing(_)));
    }
}
