//! Upload Fan-Out (§4.5): compress-and-distribute dump bytes to N sinks.
//!
//! Streaming mode feeds a checksum tee + gzip encoder straight from the
//! dump subprocess's stdout into the first sink, then re-reads that sink's
//! object to feed every additional sink in parallel — this avoids ever
//! buffering a whole dump on disk or in memory while still reaching N
//! sinks. File mode stages to disk first and fans the same file out to
//! every sink in parallel.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::checksum::ChecksumTee;
use crate::error::{BackupError, Result};
use crate::storage::{BoxedReader, ObjectStoreClient, STREAMING_SIZE};

/// One configured sink, bound to an already-connected client.
pub struct Sink {
    pub provider_id: uuid::Uuid,
    pub client: Arc<dyn ObjectStoreClient>,
}

/// Outcome of uploading to one sink.
pub struct SinkOutcome {
    pub provider_id: uuid::Uuid,
    pub object_key: String,
    pub error: Option<String>,
}

impl SinkOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate result of a fan-out attempt.
pub struct FanOutResult {
    pub outcomes: Vec<SinkOutcome>,
    pub size_bytes: u64,
    pub md5: String,
    pub sha256: String,
}

impl FanOutResult {
    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.succeeded_count()
    }

    /// Classify the outcome per §4.5's partial-failure table. Returns
    /// `Ok(())` for `N/N` and `NoSinks`; `Err` otherwise, carrying the
    /// concatenated per-sink errors.
    pub fn classify(&self) -> Result<()> {
        let total = self.outcomes.len();
        if total == 0 {
            return Ok(());
        }
        let succeeded = self.succeeded_count();
        if succeeded == total {
            return Ok(());
        }
        let errors = self
            .outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {e}", o.provider_id)))
            .collect::<Vec<_>>()
            .join("; ");
        if succeeded == 0 {
            Err(BackupError::UploadAllFailed(total, errors))
        } else {
            Err(BackupError::UploadPartial(total - succeeded, total, errors))
        }
    }
}

/// Lowercase, collapse non-`[a-z0-9]` runs to `_`, trim leading/trailing
/// `_`, clamp to 200 chars; empty input maps to `backup`.
pub fn sanitize_connection_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_sep = false;
    for ch in lower.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches('_');
    let clamped: String = trimmed.chars().take(200).collect();
    if clamped.is_empty() {
        "backup".to_string()
    } else {
        clamped
    }
}

/// The staging path for file mode: `{backupRoot}/{sanitize(connectionName)}/{databaseName}_{YYYYMMDD_HHMMSS}.sql`.
pub fn staging_path(backup_root: &Path, connection_name: &str, database_name: &str) -> PathBuf {
    let folder = sanitize_connection_name(connection_name);
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    backup_root
        .join(&folder)
        .join(format!("{database_name}_{timestamp}.sql"))
}

/// Streaming mode: the first sink consumes `reader` directly via
/// `put_stream_compressed`; additional sinks re-read the first sink's
/// object and upload in parallel. `folder`/`filename` feed the object key
/// convention (`{folder}/{filename}.gz`).
pub async fn fan_out_streaming(
    reader: BoxedReader,
    folder: &str,
    filename: &str,
    sinks: &[Sink],
    on_log: &(dyn Fn(String) + Send + Sync),
) -> Result<FanOutResult> {
    let (tee, digest_handle) = ChecksumTee::new_with_handle(reader);
    let boxed: BoxedReader = Box::pin(tee);

    let Some((first, rest)) = sinks.split_first() else {
        // No sinks configured: drain the tee so checksums are still
        // computed, discard the bytes.
        let mut tee_only = boxed;
        let mut sink = tokio::io::sink();
        tokio::io::copy(&mut tee_only, &mut sink).await?;
        let (md5, sha256) = digest_handle.finalize();
        return Ok(FanOutResult {
            outcomes: Vec::new(),
            size_bytes: 0,
            md5,
            sha256,
        });
    };

    let first_result = first.client.put_stream_compressed(boxed, filename, folder, on_log).await;

    let (first_key, first_err) = match first_result {
        Ok(key) => (key, None),
        Err(e) => (String::new(), Some(e.to_string())),
    };

    let mut outcomes = vec![SinkOutcome {
        provider_id: first.provider_id,
        object_key: first_key.clone(),
        error: first_err.clone(),
    }];

    let size_bytes = if first_err.is_none() {
        first.client.stat_object(&first_key).await.unwrap_or(0)
    } else {
        0
    };

    if first_err.is_none() && !rest.is_empty() {
        let mut tasks = Vec::with_capacity(rest.len());
        for sink in rest {
            let client = sink.client.clone();
            let provider_id = sink.provider_id;
            let key = first_key.clone();
            let source_client = first.client.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = async {
                    let source = source_client.get_object(&key).await?;
                    client.put_object(&key, source, STREAMING_SIZE, None).await
                }
                .await;
                match outcome {
                    Ok(k) => SinkOutcome {
                        provider_id,
                        object_key: k,
                        error: None,
                    },
                    Err(e) => SinkOutcome {
                        provider_id,
                        object_key: key,
                        error: Some(e.to_string()),
                    },
                }
            }));
        }
        for task in tasks {
            outcomes.push(task.await.map_err(|e| BackupError::SubprocessFailed(e.to_string()))?);
        }
    } else if first_err.is_some() {
        for sink in rest {
            outcomes.push(SinkOutcome {
                provider_id: sink.provider_id,
                object_key: String::new(),
                error: Some("skipped: first sink failed".to_string()),
            });
        }
    }

    let (md5, sha256) = digest_handle.finalize();
    Ok(FanOutResult {
        outcomes,
        size_bytes,
        md5,
        sha256,
    })
}

/// File mode: upload a staged file to every sink in parallel.
pub async fn fan_out_file(path: &Path, object_key: &str, sinks: &[Sink]) -> Result<FanOutResult> {
    let (md5, sha256) = crate::checksum::checksum_file(path).await?;
    let size_bytes = tokio::fs::metadata(path).await?.len();

    let mut tasks = Vec::with_capacity(sinks.len());
    for sink in sinks {
        let client = sink.client.clone();
        let provider_id = sink.provider_id;
        let key = object_key.to_string();
        let path = path.to_path_buf();
        tasks.push(tokio::spawn(async move {
            let outcome = async {
                let file = tokio::fs::File::open(&path).await?;
                let reader: BoxedReader = Box::pin(file);
                client.put_object(&key, reader, size_bytes as i64, None).await
            }
            .await;
            match outcome {
                Ok(k) => SinkOutcome {
                    provider_id,
                    object_key: k,
                    error: None,
                },
                Err(e) => SinkOutcome {
                    provider_id,
                    object_key: key,
                    error: Some(e.to_string()),
                },
            }
        }));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        outcomes.push(task.await.map_err(|e| BackupError::SubprocessFailed(e.to_string()))?);
    }

    Ok(FanOutResult {
        outcomes,
        size_bytes,
        md5,
        sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_and_lowercases() {
        assert_eq!(sanitize_connection_name("Prod DB!! East"), "prod_db_east");
    }

    #[test]
    fn sanitize_empty_becomes_backup() {
        assert_eq!(sanitize_connection_name("   "), "backup");
        assert_eq!(sanitize_connection_name(""), "backup");
    }

    #[test]
    fn sanitize_clamps_to_200_chars() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_connection_name(&long).len(), 200);
    }

    #[test]
    fn sanitize_trims_leading_and_trailing_separators() {
        assert_eq!(sanitize_connection_name("--prod--"), "prod");
    }

    #[test]
    fn classify_no_sinks_is_ok() {
        let result = FanOutResult {
            outcomes: Vec::new(),
            size_bytes: 0,
            md5: String::new(),
            sha256: String::new(),
        };
        assert!(result.classify().is_ok());
    }

    #[test]
    fn classify_all_failed() {
        let result = FanOutResult {
            outcomes: vec![SinkOutcome {
                provider_id: uuid::Uuid::new_v4(),
                object_key: String::new(),
                error: Some("boom".to_string()),
            }],
            size_bytes: 0,
            md5: String::new(),
            sha256: String::new(),
        };
        assert!(matches!(result.classify(), Err(BackupError::UploadAllFailed(1, _))));
    }

    #[test]
    fn classify_partial_failure() {
        let result = FanOutResult {
            outcomes: vec![
                SinkOutcome {
                    provider_id: uuid::Uuid::new_v4(),
                    object_key: "k".to_string(),
                    error: None,
                },
                SinkOutcome {
                    provider_id: uuid::Uuid::new_v4(),
                    object_key: String::new(),
                    error: Some("boom".to_string()),
                },
            ],
            size_bytes: 10,
            md5: String::new(),
            sha256: String::new(),
        };
        assert!(matches!(result.classify(), Err(BackupError::UploadPartial(1, 2, _))));
    }
}
