//! Error types for the backup orchestration engine.

use thiserror::Error;

/// Main error type for backup operations.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("required dump tool not found: {0}")]
    ToolMissing(String),

    #[error("SSH tunnel setup failed: {0}")]
    TunnelSetupFailed(String),

    #[error("dump subprocess failed: {0}")]
    SubprocessFailed(String),

    #[error("client/server version mismatch: {0}")]
    VersionMismatchError(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("{0} of {1} sinks failed to receive the backup: {2}")]
    UploadPartial(usize, usize, String),

    #[error("all {0} configured sinks failed: {1}")]
    UploadAllFailed(usize, String),

    #[error("invalid credential field: {0}")]
    InvalidCredential(String),

    #[error("share token invalid or expired")]
    ShareInvalid,

    #[error("run canceled: {0}")]
    Canceled(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid backup state: {0}")]
    InvalidState(String),

    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Storage backend specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("bucket inaccessible: {0}")]
    BucketInaccessible(String),

    #[error("bucket missing: {0}")]
    BucketMissing(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("network error: {0}")]
    Network(String),
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
