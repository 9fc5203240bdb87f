//! S3-compatible backend built on `aws-sdk-s3`.

use async_compression::tokio::bufread::GzipEncoder;
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use tokio::io::{AsyncReadExt, BufReader};

use super::{derive_key, BoxedReader, ObjectStoreClient, ObjectStoreConfig, DEFAULT_CONTENT_TYPE, STREAMING_SIZE};
use crate::error::{StorageError, StorageResult};
use crate::sanitize::{sanitize, sanitize_endpoint};

/// 8 MiB multipart chunk size — a sensible default part size for
/// streaming dump uploads without buffering the whole dump in memory.
const MULTIPART_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// S3-compatible storage backend bound to one bucket/sink.
pub struct S3Backend {
    client: Client,
    bucket: String,
    path_prefix: Option<String>,
}

impl S3Backend {
    /// Validate credentials, sanitize every field, and prove bucket
    /// access per §4.3's connect contract.
    pub async fn connect(config: ObjectStoreConfig) -> StorageResult<Self> {
        let access_key = sanitize("access_key", &config.access_key)
            .map_err(|e| StorageError::AuthFailed(e.to_string()))?;
        let secret_key = sanitize("secret_key", &config.secret_key)
            .map_err(|e| StorageError::AuthFailed(e.to_string()))?;
        let bucket = sanitize("bucket", &config.bucket)
            .map_err(|e| StorageError::AuthFailed(e.to_string()))?;
        let endpoint = sanitize_endpoint("endpoint", &config.endpoint)
            .map_err(|e| StorageError::AuthFailed(e.to_string()))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "backup-orchestrator");

        let aws_config = aws_config::from_env()
            .region(Region::new(config.region_or_default()))
            .credentials_provider(credentials)
            .endpoint_url(&endpoint)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(s3_config);

        let backend = Self {
            client,
            bucket,
            path_prefix: config.path_prefix,
        };

        if endpoint.contains("backblazeb2.com") {
            backend
                .client
                .list_objects_v2()
                .bucket(&backend.bucket)
                .max_keys(1)
                .send()
                .await
                .map_err(|e| StorageError::AuthFailed(format!("backblaze access probe failed: {e}")))?;
        } else {
            match backend.client.head_bucket().bucket(&backend.bucket).send().await {
                Ok(_) => {}
                Err(_) => {
                    backend
                        .client
                        .create_bucket()
                        .bucket(&backend.bucket)
                        .send()
                        .await
                        .map_err(|e| StorageError::BucketMissing(e.to_string()))?;
                }
            }
        }

        Ok(backend)
    }

    fn full_key(&self, key: &str) -> String {
        derive_key(self.path_prefix.as_deref(), key)
    }

    /// Stream `reader` to `key` via multipart upload, reading fixed-size
    /// chunks so the whole dump is never buffered in memory.
    async fn multipart_put(
        &self,
        full_key: &str,
        mut reader: BoxedReader,
        content_type: &str,
    ) -> StorageResult<String> {
        let upload_id = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(full_key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?
            .upload_id()
            .ok_or_else(|| StorageError::UploadFailed("no upload id returned".to_string()))?
            .to_string();

        let mut parts = Vec::new();
        let mut part_number: i32 = 1;

        loop {
            let mut chunk = vec![0u8; MULTIPART_CHUNK_BYTES];
            let mut filled = 0;
            while filled < chunk.len() {
                let n = reader
                    .read(&mut chunk[filled..])
                    .await
                    .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            chunk.truncate(filled);

            let etag = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(full_key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(Bytes::from(chunk)))
                .send()
                .await
                .map_err(|e| StorageError::UploadFailed(e.to_string()))?
                .e_tag()
                .ok_or_else(|| StorageError::UploadFailed("no etag returned".to_string()))?
                .to_string();

            parts.push(CompletedPart::builder().part_number(part_number).e_tag(etag).build());
            part_number += 1;

            if filled < MULTIPART_CHUNK_BYTES {
                break;
            }
        }

        if parts.is_empty() {
            // Zero-byte source: abort the multipart upload and fall back
            // to an empty single-shot put so the object still exists.
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(full_key)
                .upload_id(&upload_id)
                .send()
                .await;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(full_key)
                .content_type(content_type)
                .body(ByteStream::from(Bytes::new()))
                .send()
                .await
                .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
            return Ok(full_key.to_string());
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(full_key)
            .upload_id(&upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        Ok(full_key.to_string())
    }
}

#[async_trait]
impl ObjectStoreClient for S3Backend {
    async fn put_object(
        &self,
        key: &str,
        mut reader: BoxedReader,
        size: i64,
        content_type: Option<&str>,
    ) -> StorageResult<String> {
        let full_key = self.full_key(key);
        let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);

        if size == STREAMING_SIZE {
            return self.multipart_put(&full_key, reader, content_type).await;
        }

        let mut buf = Vec::with_capacity(size.max(0) as usize);
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(ByteStream::from(Bytes::from(buf)))
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        Ok(full_key)
    }

    async fn put_stream_compressed(
        &self,
        reader: BoxedReader,
        filename: &str,
        folder: &str,
        on_log: &(dyn Fn(String) + Send + Sync),
    ) -> StorageResult<String> {
        let key = format!("{folder}/{filename}.gz");
        let full_key = self.full_key(&key);

        on_log(format!("Streaming compressed backup to {full_key}"));

        let gzip = GzipEncoder::new(BufReader::new(reader));
        let boxed: BoxedReader = Box::pin(gzip);
        let result = self.multipart_put(&full_key, boxed, DEFAULT_CONTENT_TYPE).await;

        match &result {
            Ok(_) => on_log(format!("[SUCCESS] uploaded {full_key}")),
            Err(e) => on_log(format!("Failed to upload to {full_key}: {e}")),
        }

        result
    }

    async fn get_object(&self, key: &str) -> StorageResult<BoxedReader> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| StorageError::DownloadFailed(e.to_string()))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::DownloadFailed(e.to_string()))?
            .into_bytes();

        let cursor = std::io::Cursor::new(data.to_vec());
        Ok(Box::pin(cursor))
    }

    async fn stat_object(&self, key: &str) -> StorageResult<u64> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| StorageError::ObjectNotFound(format!("{full_key}: {e}")))?;

        Ok(output.content_length().unwrap_or(0) as u64)
    }

    async fn list_objects(
        &self,
        prefix: &str,
    ) -> StorageResult<Pin<Box<dyn Stream<Item = StorageResult<String>> + Send>>> {
        let full_prefix = self.full_key(prefix);
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        let keys: Vec<StorageResult<String>> = output
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(|k| Ok(k.to_string())))
            .collect();

        Ok(Box::pin(futures::stream::iter(keys)))
    }

    async fn remove_object(&self, key: &str) -> StorageResult<()> {
        let full_key = self.full_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(())
    }

    async fn test_connection(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::BucketInaccessible(e.to_string()))?;
        Ok(())
    }

    fn path_prefix(&self) -> Option<&str> {
        self.path_prefix.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend(path_prefix: Option<&str>) -> S3Backend {
        S3Backend {
            client: aws_sdk_s3::Client::from_conf(
                aws_sdk_s3::config::Builder::new()
                    .region(Region::new("us-east-1"))
                    .credentials_provider(Credentials::new("a", "b", None, None, "t"))
                    .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
                    .build(),
            ),
            bucket: "bucket".to_string(),
            path_prefix: path_prefix.map(str::to_string),
        }
    }

    #[test]
    fn full_key_applies_prefix() {
        let backend = test_backend(Some("backups"));
        assert_eq!(backend.full_key("shop/shop_20250102.sql.gz"), "backups/shop/shop_20250102.sql.gz");
    }

    #[test]
    fn full_key_without_prefix_is_unchanged() {
        let backend = test_backend(None);
        assert_eq!(backend.full_key("shop/shop_20250102.sql.gz"), "shop/shop_20250102.sql.gz");
    }
}
