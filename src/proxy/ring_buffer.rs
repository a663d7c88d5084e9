//! Lock-free ring buffer carrying serialized audit records to the audit path

use crate::proxy::types::{DroppedEventCount, RequestId, RingBufferConfig, TimestampNanos};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// One queued audit record
#[derive(Clone, Debug)]
pub struct RingBufferEntry {
    pub request_id: RequestId,
    pub timestamp: TimestampNanos,
    pub data: Vec<u8>,
}

/// Statistics about ring buffer usage
pub struct RingBufferStats {
    pub total_writes: u64,
    pub total_reads: u64,
    pub dropped_events: DroppedEventCount,
}

/// Bounded queue with overwrite-oldest semantics
///
/// Writers on the response path never block and never fail; when the audit
/// path falls behind, the oldest record is replaced and counted as dropped.
pub struct RingBuffer {
    queue: ArrayQueue<RingBufferEntry>,
    overflow_count: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
    max_data_size: usize,
}

impl RingBuffer {
    pub fn new(config: &RingBufferConfig) -> Self {
        let slot_count = *config.buffer_size.as_ref() / *config.slot_size.as_ref();
        let capacity = slot_count.next_power_of_two().max(1);

        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            max_data_size: *config.slot_size.as_ref(),
        }
    }

    /// Queue a record, truncated to the slot size
    ///
    /// Returns `Err(total_overwrites)` when an older record was displaced.
    pub fn write(&self, request_id: RequestId, data: &[u8]) -> Result<(), u64> {
        let end = data.len().min(self.max_data_size);
        let entry = RingBufferEntry {
            request_id,
            timestamp: TimestampNanos::from(
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64,
            ),
            data: data[..end].to_vec(),
        };

        self.writes.fetch_add(1, Ordering::Relaxed);
        match self.queue.force_push(entry) {
            None => Ok(()),
            Some(_displaced) => Err(self.overflow_count.fetch_add(1, Ordering::Relaxed) + 1),
        }
    }

    /// Pop the oldest queued record
    pub fn read(&self) -> Option<(RequestId, Vec<u8>)> {
        let entry = self.queue.pop()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Some((entry.request_id, entry.data))
    }

    pub fn stats(&self) -> RingBufferStats {
        RingBufferStats {
            total_writes: self.writes.load(Ordering::Relaxed),
            total_reads: self.reads.load(Ordering::Relaxed),
            dropped_events: DroppedEventCount::from(self.overflow_count.load(Ordering::Relaxed)),
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }
}
