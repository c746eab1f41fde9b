use crate::{error::TrieError, node::Node};
use ethereum_types::H256;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

/// Read access to encoded trie nodes by hash.
pub trait NodeReader: Send + Sync {
    fn node(&self, hash: H256) -> Result<Option<Vec<u8>>, TrieError>;
}

/// Sink receiving collapsed nodes while a trie is being hashed.
pub trait NodeWriter {
    /// `len_encoded` is the size of the node's encoding, saturated to `u16`.
    fn insert_node(&self, hash: H256, len_encoded: u16, node: Node) -> Result<(), TrieError>;
}

/// InMemory implementation of both node traits, keyed by node hash.
#[derive(Clone, Default)]
pub struct InMemoryNodeStore {
    inner: Arc<Mutex<BTreeMap<H256, Vec<u8>>>>,
}

impl InMemoryNodeStore {
    pub fn new_empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|db| db.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeReader for InMemoryNodeStore {
    fn node(&self, hash: H256) -> Result<Option<Vec<u8>>, TrieError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .get(&hash)
            .cloned())
    }
}

impl NodeWriter for InMemoryNodeStore {
    fn insert_node(&self, hash: H256, _len_encoded: u16, node: Node) -> Result<(), TrieError> {
        self.inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .insert(hash, node.encode_to_vec());
        Ok(())
    }
}
