use crate::api::KeyValueStore;
use ethereum_types::H256;
use std::sync::Arc;
use triedb_trie::{NodeReader, TrieError};

/// NodeReader adapter that reads trie nodes straight from a key-value store,
/// where every node is keyed by its bare hash.
pub struct StoreNodeReader {
    store: Arc<dyn KeyValueStore>,
}

impl StoreNodeReader {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

impl NodeReader for StoreNodeReader {
    fn node(&self, hash: H256) -> Result<Option<Vec<u8>>, TrieError> {
        self.store
            .get(hash.as_bytes())
            .map_err(|err| TrieError::DbError(err.to_string()))
    }
}
