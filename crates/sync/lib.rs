//! Trie synchronisation.
//!
//! [`TrieSync`] walks a remote trie top-down: it hands out the hashes it is
//! missing, accepts their contents, discovers children and stages every node
//! in a [`SyncMemBatch`] only once its whole subtree has arrived. Flushing
//! the mem-batch therefore never leaves a node on disk whose descendants are
//! absent.
//!
//! [`SyncBloom`] and [`SyncLru`] answer "is this hash already on disk"
//! without touching the store.

mod bloom;
mod error;
mod lru_set;
mod membatch;
pub mod metrics;
mod sync;

pub use bloom::SyncBloom;
pub use error::{ProcessError, SyncError};
pub use lru_set::SyncLru;
pub use membatch::SyncMemBatch;
pub use metrics::SyncMetrics;
pub use sync::{
    EMPTY_CODE_HASH, LeafCallback, LeafEntry, LeafFollowUp, MAX_FETCHES_PER_DEPTH, SyncPath,
    SyncResult, TrieSync, new_sync_path,
};
