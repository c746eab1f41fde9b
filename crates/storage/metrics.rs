use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight atomic counters for store instrumentation.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Number of point reads (`get`/`has`)
    pub reads: AtomicU64,
    /// Number of keys written, through batches or direct puts
    pub keys_written: AtomicU64,
    /// Number of batch writes
    pub batch_writes: AtomicU64,
    /// Bytes written, keys plus values
    pub bytes_written: AtomicU64,
}

impl StoreMetrics {
    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, keys: u64, bytes: u64) {
        self.keys_written.fetch_add(keys, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batch_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters for logging/reporting.
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            keys_written: self.keys_written.load(Ordering::Relaxed),
            batch_writes: self.batch_writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    pub reads: u64,
    pub keys_written: u64,
    pub batch_writes: u64,
    pub bytes_written: u64,
}

impl fmt::Display for StoreMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reads={} keys_written={} batches={} bytes_written={}",
            self.reads, self.keys_written, self.batch_writes, self.bytes_written
        )
    }
}
