use ethereum_types::H256;
use thiserror::Error;
use triedb_storage::StoreError;
use triedb_trie::TrieError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Not requested: {0:#x}")]
    NotRequested(H256),
    #[error("Already processed: {0:#x}")]
    AlreadyProcessed(H256),
    #[error("Failed to decode node {hash:#x}: {source}")]
    Decode { hash: H256, source: TrieError },
    #[error("Unknown parent request {0:#x}")]
    UnknownParent(H256),
    #[error("Leaf callback failed: {0}")]
    Callback(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to commit sync batch after {written} entries: {source}")]
    Commit { written: usize, source: StoreError },
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl From<prometheus::Error> for SyncError {
    fn from(err: prometheus::Error) -> Self {
        SyncError::Metrics(err.to_string())
    }
}

/// Failure of one result inside a [`TrieSync::process`](crate::TrieSync::process) batch.
#[derive(Debug, Error)]
#[error("Failed to process sync result {index}: {source}")]
pub struct ProcessError {
    /// Position of the rejected result.
    pub index: usize,
    /// Whether earlier results of the batch staged anything.
    pub committed: bool,
    #[source]
    pub source: SyncError,
}
