//! Shared in-memory buffer between the detection cycles and the batcher.

use std::sync::{Mutex, MutexGuard, PoisonError};
use vigil_core::EventRecord;

#[derive(Default)]
struct BufferState {
    records: Vec<EventRecord>,
    open: bool,
}

/// Session-scoped event buffer.
///
/// Appends and drains each take the lock once, so a concurrent append lands
/// in exactly one drained batch. Once closed, appends are refused; records
/// already buffered stay drainable.
pub struct DetectionBuffer {
    state: Mutex<BufferState>,
}

impl DetectionBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState {
                records: Vec::new(),
                open: true,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append records in order. Returns `false` (and drops them) when closed.
    pub fn append(&self, records: Vec<EventRecord>) -> bool {
        let mut state = self.lock();
        if !state.open {
            return false;
        }
        state.records.extend(records);
        true
    }

    /// Snapshot and clear.
    pub fn drain(&self) -> Vec<EventRecord> {
        std::mem::take(&mut self.lock().records)
    }

    pub fn close(&self) {
        self.lock().open = false;
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }
}

impl Default for DetectionBuffer {
    fn default() -> Self {
        Self::new()
    }
}
