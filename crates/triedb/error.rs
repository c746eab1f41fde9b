use ethereum_types::H256;
use thiserror::Error;
use triedb_cache::CacheError;
use triedb_storage::StoreError;
use triedb_trie::TrieError;

use crate::metrics::MetricsError;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Zero hash node is not a valid trie node")]
    ZeroHashNode,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Trie(#[from] TrieError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("trie node cache is disabled, nothing to save to file")]
    CacheDisabled,
    #[error("saving trie node cache has been triggered already")]
    CacheSaveInProgress,
    #[error("Trie cache memory leak: {} unreachable nodes", .0.len())]
    Integrity(Vec<H256>),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("Failed to lock node database")]
    LockError,
}
