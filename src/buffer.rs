//! Bounded accumulation buffer between callback threads and the drain loop
//!
//! Callback threads push structured records under a short lock; the consumer
//! drains everything at a fixed cadence. When the buffer is full new records
//! are dropped and counted rather than growing without bound.

use crate::record::StructuredRecord;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

pub const DEFAULT_CAPACITY: usize = 65_536;

pub struct RecordBuffer {
    records: Mutex<Vec<StructuredRecord>>,
    capacity: usize,
    total_pushed: AtomicU64,
    total_dropped: AtomicU64,
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RecordBuffer {
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Record buffer capacity must be > 0");
        Self {
            records: Mutex::new(Vec::new()),
            capacity,
            total_pushed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Returns false when the record was dropped for backpressure
    pub fn push(&self, record: StructuredRecord) -> bool {
        self.total_pushed.fetch_add(1, Ordering::Relaxed);

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= self.capacity {
            drop(records);
            let dropped = self.total_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, "record buffer full - records dropped (backpressure)");
            }
            return false;
        }
        records.push(record);
        true
    }

    /// Take everything buffered so far, in push order
    pub fn drain(&self) -> Vec<StructuredRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        mem::take(&mut *records)
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.records.lock().unwrap_or_else(PoisonError::into_inner).len(),
            capacity: self.capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl BufferStats {
    /// Calculate drop rate (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        if self.total_pushed == 0 {
            0.0
        } else {
            self.total_dropped as f64 / self.total_pushed as f64
        }
    }
}
