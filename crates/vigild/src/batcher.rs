//! Periodic flush of the detection buffer into the persistence sink.

use crate::buffer::DetectionBuffer;
use crate::notice::Notice;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use vigil_core::event::normalize_batch;
use vigil_core::PersistenceSink;

/// Lifetime write counters, shared across sessions.
#[derive(Debug, Default)]
pub struct FlushStats {
    flushed: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushCounters {
    pub flushed_total: u64,
    pub dropped_total: u64,
    pub batches_total: u64,
}

impl FlushStats {
    pub fn snapshot(&self) -> FlushCounters {
        FlushCounters {
            flushed_total: self.flushed.load(Ordering::Relaxed),
            dropped_total: self.dropped.load(Ordering::Relaxed),
            batches_total: self.batches.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Written(usize),
    /// The sink rejected the batch; it was discarded.
    Dropped(usize),
}

pub struct EventBatcher {
    buffer: Arc<DetectionBuffer>,
    sink: Arc<dyn PersistenceSink>,
    stats: Arc<FlushStats>,
    notices: broadcast::Sender<Notice>,
}

impl EventBatcher {
    pub fn new(
        buffer: Arc<DetectionBuffer>,
        sink: Arc<dyn PersistenceSink>,
        stats: Arc<FlushStats>,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        Self {
            buffer,
            sink,
            stats,
            notices,
        }
    }

    /// Drain the buffer and write it as one batch.
    ///
    /// A failed write is not retried: the snapshot is gone once drained.
    pub async fn flush(&self) -> FlushOutcome {
        let records = self.buffer.drain();
        if records.is_empty() {
            return FlushOutcome::Empty;
        }

        let rows = normalize_batch(&records);
        let count = rows.len();

        match self.sink.insert_events(&rows).await {
            Ok(()) => {
                self.stats.flushed.fetch_add(count as u64, Ordering::Relaxed);
                self.stats.batches.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(rows = count, "event batch written");
                FlushOutcome::Written(count)
            }
            Err(e) => {
                self.stats.dropped.fetch_add(count as u64, Ordering::Relaxed);
                tracing::error!(rows = count, error = %e, "event batch write failed; batch dropped");
                let _ = self.notices.send(Notice::FlushFailed {
                    dropped: count,
                    reason: e.to_string(),
                });
                FlushOutcome::Dropped(count)
            }
        }
    }

    /// Flush every `period` until `shutdown` flips to true or its sender is
    /// dropped. The first flush happens one full period after the call.
    ///
    /// Shutdown is only observed between ticks: a flush already handed to
    /// the sink runs to completion before the task returns.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("batch flush task finished");
    }
}
