//! Byte-level cache of encoded trie nodes fronting the disk store.
//!
//! Three variants share the [`TrieNodeCache`] interface: an in-process
//! [`LocalCache`], a [`RemoteCache`] talking to a redis server or cluster, and
//! a [`HybridCache`] composing both. Block pub-sub is only offered by caches
//! that have a remote tier, through [`TrieNodeCache::as_pubsub`].

mod config;
mod error;
mod hybrid;
mod local;
mod remote;

use std::{path::Path, sync::Arc};

use crossbeam::channel::Receiver;
use ethereum_types::H256;
use tracing::{info, warn};

pub use config::{
    AUTO_SCALING, CacheType, TrieNodeCacheConfig, auto_scaled_cache_mib, total_physical_memory,
};
pub use error::CacheError;
pub use hybrid::HybridCache;
pub use local::LocalCache;
pub use remote::{BLOCK_CHANNEL, RemoteCache};

/// Point-in-time statistics of a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub bytes_size: u64,
    pub get_calls: u64,
    pub set_calls: u64,
    pub hits: u64,
    pub misses: u64,
    /// Sets that replaced a live entry
    pub collisions: u64,
    /// Entries dropped to respect the size budget
    pub evictions: u64,
}

pub trait TrieNodeCache: Send + Sync {
    /// Returns the value most recently set for `key` by this process, if the
    /// cache still holds it.
    fn get(&self, key: &H256) -> Option<Vec<u8>>;

    fn set(&self, key: H256, value: Vec<u8>);

    /// Returns the value when present. A `Some` is always current.
    fn has(&self, key: &H256) -> Option<Vec<u8>>;

    /// Atomically replaces the snapshot in `dir` with the current content.
    fn save_to_file(&self, dir: &Path, concurrency: usize) -> Result<(), CacheError>;

    fn update_stats(&self) -> Option<CacheStats>;

    fn close(&self) -> Result<(), CacheError>;

    /// Block pub-sub capability, available when a remote tier is configured.
    fn as_pubsub(&self) -> Option<&dyn BlockPubSub> {
        None
    }
}

/// Best-effort fan-out of block notifications across peers sharing a cache.
pub trait BlockPubSub: Send + Sync {
    fn publish_block(&self, msg: &str) -> Result<(), CacheError>;

    fn subscribe_block(&self) -> Result<Receiver<String>, CacheError>;

    fn unsubscribe_block(&self) -> Result<(), CacheError>;
}

/// Builds the cache described by `config`. Returns `None` when the
/// configuration leaves no cache tier enabled.
pub fn new_trie_node_cache(
    config: &TrieNodeCacheConfig,
) -> Result<Option<Arc<dyn TrieNodeCache>>, CacheError> {
    let cache: Option<Arc<dyn TrieNodeCache>> = match config.cache_type {
        CacheType::Local => LocalCache::from_config(config)?
            .map(|local| Arc::new(local) as Arc<dyn TrieNodeCache>),
        CacheType::Remote => Some(Arc::new(RemoteCache::new(config)?)),
        CacheType::Hybrid => {
            let remote = RemoteCache::new(config)?;
            match LocalCache::from_config(config)? {
                Some(local) => Some(Arc::new(HybridCache::new(local, remote))),
                None => {
                    warn!("Local cache size is zero, hybrid cache falls back to remote only");
                    Some(Arc::new(remote))
                }
            }
        }
    };
    match &cache {
        Some(_) => info!(cache_type = %config.cache_type, "Initialized trie node cache"),
        None => info!("Trie node cache is disabled"),
    }
    Ok(cache)
}
