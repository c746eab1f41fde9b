use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

use crate::SyncError;

/// Collectors describing one trie sync run.
#[derive(Debug, Clone)]
pub struct SyncMetrics {
    /// Bloom hits that the store did not confirm
    pub bloom_faults: IntCounter,
    pub retrieved: IntCounter,
    pub committed: IntCounter,
}

impl SyncMetrics {
    pub fn new() -> Result<Self, SyncError> {
        Ok(Self {
            bloom_faults: IntCounter::new(
                "triedb_sync_bloom_fault_total",
                "Bloom filter hits for hashes missing from the store",
            )?,
            retrieved: IntCounter::new(
                "triedb_sync_retrieved_total",
                "Requests scheduled for retrieval",
            )?,
            committed: IntCounter::new(
                "triedb_sync_committed_total",
                "Requests whose subtree completed",
            )?,
        })
    }

    pub fn gather_metrics(&self) -> Result<String, SyncError> {
        let r = Registry::new();

        r.register(Box::new(self.bloom_faults.clone()))?;
        r.register(Box::new(self.retrieved.clone()))?;
        r.register(Box::new(self.committed.clone()))?;

        let encoder = TextEncoder::new();
        let metric_families = r.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer).map_err(|err| SyncError::Metrics(err.to_string()))
    }
}
