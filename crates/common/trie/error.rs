use ethereum_types::H256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrieError {
    #[error(transparent)]
    RLPDecode(#[from] alloy_rlp::Error),
    #[error("Invalid node encoding: {0}")]
    InvalidNode(String),
    #[error("Missing trie node {0:#x}")]
    MissingNode(H256),
    #[error("Lock Error: Panicked when trying to acquire a lock")]
    LockError,
    #[error("Database error: {0}")]
    DbError(String),
}
