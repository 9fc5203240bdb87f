//! Single-pass MD5 + SHA-256 checksum tee.
//!
//! Wraps an `AsyncRead` so every byte that passes through is fed into both
//! digests without a second read of the underlying source. Used both to
//! record integrity metadata on a completed backup and, later, to verify a
//! downloaded object against its recorded SHA-256.

use md5::{Digest as Md5Digest, Md5};
use pin_project_lite::pin_project;
use sha2::{Digest as Sha256Digest, Sha256};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{BackupError, Result};

pin_project! {
    /// A tee that hashes every byte read from the wrapped source.
    pub struct ChecksumTee<R> {
        #[pin]
        inner: R,
        md5: Arc<Mutex<Md5>>,
        sha256: Arc<Mutex<Sha256>>,
    }
}

/// A cloneable handle onto a tee's in-progress digests, usable after the
/// tee itself has been moved behind a trait object (e.g. a `BoxedReader`)
/// and consumed by a caller that only returns once EOF is reached.
#[derive(Clone)]
pub struct DigestHandle {
    md5: Arc<Mutex<Md5>>,
    sha256: Arc<Mutex<Sha256>>,
}

impl DigestHandle {
    /// Snapshot the current digest state and finalize it. Call only after
    /// the underlying tee has been fully drained; calling earlier yields a
    /// partial digest.
    pub fn finalize(&self) -> (String, String) {
        let md5_hex = format!("{:x}", self.md5.lock().unwrap().clone().finalize());
        let sha256_hex = format!("{:x}", self.sha256.lock().unwrap().clone().finalize());
        (md5_hex, sha256_hex)
    }
}

impl<R> ChecksumTee<R> {
    /// Wrap a byte source, computing digests as it is read.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            md5: Arc::new(Mutex::new(Md5::new())),
            sha256: Arc::new(Mutex::new(Sha256::new())),
        }
    }

    /// Wrap a byte source, returning the tee alongside a [`DigestHandle`]
    /// that survives the tee being boxed and moved into a callee.
    pub fn new_with_handle(inner: R) -> (Self, DigestHandle) {
        let tee = Self::new(inner);
        let handle = DigestHandle {
            md5: tee.md5.clone(),
            sha256: tee.sha256.clone(),
        };
        (tee, handle)
    }

    /// Finalize both digests. Consumes the tee; call only once the
    /// underlying source has been fully drained.
    pub fn finalize(self) -> (String, String) {
        let md5_hex = format!("{:x}", Arc::try_unwrap(self.md5).unwrap().into_inner().unwrap().finalize());
        let sha256_hex = format!("{:x}", Arc::try_unwrap(self.sha256).unwrap().into_inner().unwrap().finalize());
        (md5_hex, sha256_hex)
    }
}

impl<R: AsyncRead> AsyncRead for ChecksumTee<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let poll = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let new_bytes = &buf.filled()[before..];
            if !new_bytes.is_empty() {
                this.md5.lock().unwrap().update(new_bytes);
                this.sha256.lock().unwrap().update(new_bytes);
            }
        }
        poll
    }
}

/// Compute MD5 + SHA-256 over an already-written file in one pass.
pub async fn checksum_file(path: &Path) -> Result<(String, String)> {
    let file = tokio::fs::File::open(path).await?;
    let mut tee = ChecksumTee::new(file);
    let mut sink = tokio::io::sink();
    tokio::io::copy(&mut tee, &mut sink).await?;
    Ok(tee.finalize())
}

/// Verify a file on disk against an expected SHA-256 hex digest.
pub async fn verify_checksum(path: &Path, expected_sha256: &str) -> Result<()> {
    let (_, actual) = checksum_file(path).await?;
    if !actual.eq_ignore_ascii_case(expected_sha256) {
        return Err(BackupError::ChecksumMismatch {
            expected: expected_sha256.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn tee_matches_reference_digests() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut tee = ChecksumTee::new(Cursor::new(data.clone()));
        let mut buf = Vec::new();
        tee.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, data);

        let (md5_hex, sha256_hex) = tee.finalize();

        let mut md5 = Md5::new();
        md5.update(&data);
        assert_eq!(md5_hex, format!("{:x}", md5.finalize()));

        let mut sha256 = Sha256::new();
        sha256.update(&data);
        assert_eq!(sha256_hex, format!("{:x}", sha256.finalize()));
    }

    #[tokio::test]
    async fn roundtrip_preserves_bytes_exactly() {
        let data = vec![0u8, 1, 2, 255, 254, 253, 42];
        let mut tee = ChecksumTee::new(Cursor::new(data.clone()));
        let mut out = Vec::new();
        tee.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn verify_checksum_detects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let err = verify_checksum(&path, "0000000000000000000000000000000000000000000000000000000000000000")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn verify_checksum_accepts_matching_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let (_, sha256) = checksum_file(&path).await.unwrap();
        verify_checksum(&path, &sha256).await.unwrap();
    }
}
