use std::time::Duration;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;
use triedb_cache::CacheStats;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("{0}")]
    PrometheusErr(String),
    #[error(transparent)]
    FromUtf8Error(#[from] std::string::FromUtf8Error),
}

impl From<prometheus::Error> for MetricsError {
    fn from(err: prometheus::Error) -> Self {
        MetricsError::PrometheusErr(err.to_string())
    }
}

/// Collectors describing the node database. Each database owns its own set.
#[derive(Debug, Clone)]
pub struct TrieDbMetrics {
    pub flush_time: IntGauge,
    pub flush_nodes: IntGauge,
    pub flush_size: IntGauge,

    pub gc_time: IntGauge,
    pub gc_nodes: IntCounter,
    pub gc_size: IntCounter,

    pub commit_time: IntGauge,
    pub commit_nodes: IntCounter,
    pub commit_size: IntCounter,
    pub uncache_time: IntGauge,

    pub clean_hit: IntCounter,
    pub clean_miss: IntCounter,
    pub clean_read: IntCounter,
    pub clean_write: IntCounter,

    /// Staged nodes, sentinel included
    pub nodes: IntGauge,
    pub cache_entries: IntGauge,
    pub cache_bytes: IntGauge,
}

impl TrieDbMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        Ok(Self {
            flush_time: IntGauge::new(
                "triedb_memcache_flush_time_us",
                "Duration of the last flush triggered by cap, in microseconds",
            )?,
            flush_nodes: IntGauge::new(
                "triedb_memcache_flush_nodes",
                "Nodes written to disk by the last cap",
            )?,
            flush_size: IntGauge::new(
                "triedb_memcache_flush_size_bytes",
                "Bytes released from staging by the last cap",
            )?,
            gc_time: IntGauge::new(
                "triedb_memcache_gc_time_us",
                "Duration of the last dereference, in microseconds",
            )?,
            gc_nodes: IntCounter::new(
                "triedb_memcache_gc_nodes_total",
                "Staged nodes garbage collected by dereference",
            )?,
            gc_size: IntCounter::new(
                "triedb_memcache_gc_size_bytes_total",
                "Staged bytes garbage collected by dereference",
            )?,
            commit_time: IntGauge::new(
                "triedb_memcache_commit_time_us",
                "Duration of the last commit, in microseconds",
            )?,
            commit_nodes: IntCounter::new(
                "triedb_memcache_commit_nodes_total",
                "Nodes persisted by commit",
            )?,
            commit_size: IntCounter::new(
                "triedb_memcache_commit_size_bytes_total",
                "Staged bytes persisted by commit",
            )?,
            uncache_time: IntGauge::new(
                "triedb_memcache_uncache_time_us",
                "Duration of the uncache step of the last commit, in microseconds",
            )?,
            clean_hit: IntCounter::new(
                "triedb_memcache_clean_hit_total",
                "Node reads served by the trie node cache",
            )?,
            clean_miss: IntCounter::new(
                "triedb_memcache_clean_miss_total",
                "Node reads that fell through to disk",
            )?,
            clean_read: IntCounter::new(
                "triedb_memcache_clean_read_bytes_total",
                "Bytes read from the trie node cache",
            )?,
            clean_write: IntCounter::new(
                "triedb_memcache_clean_write_bytes_total",
                "Bytes written to the trie node cache",
            )?,
            nodes: IntGauge::new("triedb_memcache_nodes", "Nodes currently staged in memory")?,
            cache_entries: IntGauge::new(
                "triedb_trie_node_cache_entries",
                "Entries held by the local trie node cache",
            )?,
            cache_bytes: IntGauge::new(
                "triedb_trie_node_cache_bytes",
                "Bytes held by the local trie node cache",
            )?,
        })
    }

    pub(crate) fn record_flush(&self, elapsed: Duration, nodes: usize, size: u64) {
        self.flush_time.set(micros(elapsed));
        self.flush_nodes.set(saturating_i64(nodes as u64));
        self.flush_size.set(saturating_i64(size));
    }

    pub(crate) fn record_gc(&self, elapsed: Duration, nodes: usize, size: u64) {
        self.gc_time.set(micros(elapsed));
        self.gc_nodes.inc_by(nodes as u64);
        self.gc_size.inc_by(size);
    }

    pub(crate) fn record_commit(
        &self,
        elapsed: Duration,
        uncache: Duration,
        nodes: usize,
        size: u64,
    ) {
        self.commit_time.set(micros(elapsed));
        self.uncache_time.set(micros(uncache));
        self.commit_nodes.inc_by(nodes as u64);
        self.commit_size.inc_by(size);
    }

    pub(crate) fn record_cache_stats(&self, stats: &CacheStats) {
        self.cache_entries.set(saturating_i64(stats.entries));
        self.cache_bytes.set(saturating_i64(stats.bytes_size));
    }

    pub fn gather_metrics(&self) -> Result<String, MetricsError> {
        let r = Registry::new();

        r.register(Box::new(self.flush_time.clone()))?;
        r.register(Box::new(self.flush_nodes.clone()))?;
        r.register(Box::new(self.flush_size.clone()))?;
        r.register(Box::new(self.gc_time.clone()))?;
        r.register(Box::new(self.gc_nodes.clone()))?;
        r.register(Box::new(self.gc_size.clone()))?;
        r.register(Box::new(self.commit_time.clone()))?;
        r.register(Box::new(self.commit_nodes.clone()))?;
        r.register(Box::new(self.commit_size.clone()))?;
        r.register(Box::new(self.uncache_time.clone()))?;
        r.register(Box::new(self.clean_hit.clone()))?;
        r.register(Box::new(self.clean_miss.clone()))?;
        r.register(Box::new(self.clean_read.clone()))?;
        r.register(Box::new(self.clean_write.clone()))?;
        r.register(Box::new(self.nodes.clone()))?;
        r.register(Box::new(self.cache_entries.clone()))?;
        r.register(Box::new(self.cache_bytes.clone()))?;

        let encoder = TextEncoder::new();
        let metric_families = r.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        let res = String::from_utf8(buffer)?;

        Ok(res)
    }
}

fn micros(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX)
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
