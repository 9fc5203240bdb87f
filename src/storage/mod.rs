//! S3-compatible object-store client.
//!
//! One [`ObjectStoreClient`] handle corresponds to one configured sink
//! (provider + bucket + optional path prefix). Every configured field is
//! re-sanitized at [`connect`] time even though callers are expected to
//! have sanitized on save — the failure mode of a stray credential
//! whitespace character is an opaque rejection from the object store, and
//! that is expensive enough to diagnose that sanitizing twice is cheap
//! insurance.

pub mod s3;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::StorageResult;

/// Configuration for one S3-compatible sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub region: Option<String>,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub use_tls: bool,
    pub path_prefix: Option<String>,
}

impl ObjectStoreConfig {
    /// The effective region, defaulting to `us-east-1` per §3.
    pub fn region_or_default(&self) -> String {
        self.region.clone().unwrap_or_else(|| "us-east-1".to_string())
    }
}

/// A line emitted by a long-running upload, forwarded to the log bus.
pub type ProgressLog = Box<dyn Fn(String) + Send + Sync>;

/// A boxed async reader, used at the trait boundary where the concrete
/// reader type (pipe, file, tee) varies by call site.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// A boxed async writer, used for the read side of a streamed download.
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send + Unpin>>;

/// Size sentinel requesting multipart streaming instead of a single-shot
/// put (the source length is not known ahead of time).
pub const STREAMING_SIZE: i64 = -1;

/// Trait for an S3-compatible object-store client bound to one sink.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Upload `reader` to `key`. `size == STREAMING_SIZE` triggers
    /// multipart streaming with a sensible part size; otherwise a
    /// single-shot put is used. Returns the final storage key (prefix
    /// applied).
    async fn put_object(
        &self,
        key: &str,
        reader: BoxedReader,
        size: i64,
        content_type: Option<&str>,
    ) -> StorageResult<String>;

    /// Gzip-wrap `reader`, derive the key as
    /// `{pathPrefix?}/{folder}/{filename}.gz`, stream the upload, and
    /// report progress lines via `on_log`.
    async fn put_stream_compressed(
        &self,
        reader: BoxedReader,
        filename: &str,
        folder: &str,
        on_log: &(dyn Fn(String) + Send + Sync),
    ) -> StorageResult<String>;

    /// Open a reader over a stored object.
    async fn get_object(&self, key: &str) -> StorageResult<BoxedReader>;

    /// Return the size in bytes of a stored object.
    async fn stat_object(&self, key: &str) -> StorageResult<u64>;

    /// List every key under `prefix`.
    async fn list_objects(
        &self,
        prefix: &str,
    ) -> StorageResult<Pin<Box<dyn Stream<Item = StorageResult<String>> + Send>>>;

    /// Delete a stored object.
    async fn remove_object(&self, key: &str) -> StorageResult<()>;

    /// Probe connectivity and credentials without mutating the bucket.
    async fn test_connection(&self) -> StorageResult<()>;

    /// The effective key prefix this client applies to every write.
    fn path_prefix(&self) -> Option<&str>;
}

/// Derive the final key: `join(trimRight(pathPrefix, "/"), trimLeft(filename, "/"))`.
pub fn derive_key(path_prefix: Option<&str>, filename: &str) -> String {
    let name = filename.trim_start_matches('/');
    match path_prefix {
        Some(prefix) if !prefix.is_empty() => {
            format!("{}/{}", prefix.trim_end_matches('/'), name)
        }
        _ => name.to_string(),
    }
}

/// Default content type applied when the caller does not specify one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Create and validate an S3-compatible client from configuration.
///
/// Endpoints containing `backblazeb2.com` skip the `bucketExists` probe
/// (the access key may lack `ListBuckets`) and instead perform a 1-key
/// `listObjects` to prove access; every other endpoint probes
/// `bucketExists` and creates the bucket if it is absent.
pub async fn connect(config: ObjectStoreConfig) -> StorageResult<s3::S3Backend> {
    s3::S3Backend::connect(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_joins_prefix_and_trims_slashes() {
        assert_eq!(
            derive_key(Some("backups/"), "/shop_20250102.sql.gz"),
            "backups/shop_20250102.sql.gz"
        );
        assert_eq!(derive_key(None, "shop_20250102.sql.gz"), "shop_20250102.sql.gz");
        assert_eq!(derive_key(Some(""), "/x"), "x");
    }

    #[test]
    fn region_defaults_to_us_east_1() {
        let cfg = ObjectStoreConfig {
            endpoint: "https://s3.example.com".into(),
            region: None,
            bucket: "b".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            use_tls: true,
            path_prefix: None,
        };
        assert_eq!(cfg.region_or_default(), "us-east-1");
    }
}
