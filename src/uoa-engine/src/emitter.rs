//! Trigger emission: sinks and the bounded outbound queue between the
//! engine and them.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::Trigger;
use sqlx::PgPool;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Destination for finalized triggers.
/// Mockable for testing via mockall.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TriggerSink: Send + Sync {
    async fn emit(&self, trigger: &Trigger) -> Result<(), EmitError>;

    /// Push out anything buffered.
    async fn flush(&self) -> Result<(), EmitError>;
}

/// Writes one JSON object per line.
pub struct JsonlSink {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl JsonlSink {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(tokio::io::stdout()))
    }

    /// Create (truncate) `path` and write to it.
    pub async fn create(path: &Path) -> Result<Self, EmitError> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self::new(Box::new(tokio::io::BufWriter::new(file))))
    }
}

#[async_trait]
impl TriggerSink for JsonlSink {
    async fn emit(&self, trigger: &Trigger) -> Result<(), EmitError> {
        let mut line = serde_json::to_vec(trigger)?;
        line.push(b'\n');
        self.writer.lock().await.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), EmitError> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}

/// Inserts triggers into `uoa_triggers`; re-emitting an id is a no-op.
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerSink for PostgresSink {
    async fn emit(&self, trigger: &Trigger) -> Result<(), EmitError> {
        if !common::insert_trigger(&self.pool, trigger).await? {
            info!("[EMIT] Trigger {} already stored", trigger.trigger_id);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), EmitError> {
        Ok(())
    }
}

/// Sends each trigger to every inner sink. The first error is returned after
/// all sinks have been tried.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TriggerSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn TriggerSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl TriggerSink for FanoutSink {
    async fn emit(&self, trigger: &Trigger) -> Result<(), EmitError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(trigger).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn flush(&self) -> Result<(), EmitError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.flush().await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// What the queue does when a producer finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued trigger
    DropOldest,
    /// Wait for room, then drop the new trigger once `timeout` passes
    Block { timeout: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest entry
    DroppedOldest,
    /// Not queued: no room before the timeout, or the queue is closed
    Rejected,
}

struct QueueState {
    items: VecDeque<Trigger>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer trigger queue.
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // Critical sections never panic, so a poisoned lock still holds valid data
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn push(&self, trigger: Trigger) -> PushOutcome {
        let deadline = match self.policy {
            OverflowPolicy::DropOldest => None,
            OverflowPolicy::Block { timeout } => Some(tokio::time::Instant::now() + timeout),
        };

        loop {
            let room = self.not_full.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return PushOutcome::Rejected;
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(trigger);
                    self.not_empty.notify_one();
                    return PushOutcome::Queued;
                }
                if deadline.is_none() {
                    if let Some(evicted) = state.items.pop_front() {
                        warn!(
                            "[EMIT] Queue full, dropping oldest trigger {} {}",
                            evicted.symbol, evicted.bucket_of_day
                        );
                    }
                    state.items.push_back(trigger);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.not_empty.notify_one();
                    return PushOutcome::DroppedOldest;
                }
            }

            if let Some(deadline) = deadline {
                if tokio::time::timeout_at(deadline, room).await.is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "[EMIT] Queue full for {:?}, dropping trigger {} {}",
                        self.policy, trigger.symbol, trigger.bucket_of_day
                    );
                    return PushOutcome::Rejected;
                }
            }
        }
    }

    /// Next trigger, waiting if empty. `None` once closed and drained.
    pub async fn pop(&self) -> Option<Trigger> {
        loop {
            let ready = self.not_empty.notified();
            {
                let mut state = self.lock();
                if let Some(trigger) = state.items.pop_front() {
                    self.not_full.notify_one();
                    return Some(trigger);
                }
                if state.closed {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Stop accepting triggers. Queued triggers can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_one();
        self.not_full.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Triggers lost to overflow or to a closed queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub emitted: u64,
    pub failed: u64,
}

/// Drain the queue into `sink` until it is closed and empty.
pub async fn run_dispatcher(queue: Arc<OutboundQueue>, sink: Arc<dyn TriggerSink>) -> DispatchStats {
    let mut stats = DispatchStats::default();

    while let Some(trigger) = queue.pop().await {
        match sink.emit(&trigger).await {
            Ok(()) => stats.emitted += 1,
            Err(e) => {
                stats.failed += 1;
                error!("[EMIT] Failed to emit {} {}: {}", trigger.symbol, trigger.trigger_id, e);
            }
        }
    }

    if let Err(e) = sink.flush().await {
        error!("[EMIT] Failed to flush sink: {}", e);
    }
    info!(
        "[EMIT] Dispatcher done: {} emitted, {} failed",
        stats.emitted, stats.failed
    );
    stats
}
