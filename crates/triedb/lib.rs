//! In-memory staging layer for Merkle-Patricia trie nodes.
//!
//! [`NodeDatabase`] buffers collapsed trie nodes produced by the hasher,
//! tracks references between them and defers disk writes until memory
//! pressure ([`NodeDatabase::cap`]) or an explicit
//! [`NodeDatabase::commit`].

mod cache_file;
mod database;
mod error;
pub mod metrics;
mod staging;

pub use database::{COMMIT_RESULT_CHANNEL_LIMIT, NodeDatabase, NodeInfo, PREIMAGE_FLUSH_THRESHOLD};
pub use error::DatabaseError;
pub use metrics::{MetricsError, TrieDbMetrics};
