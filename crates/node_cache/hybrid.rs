use std::path::Path;

use ethereum_types::H256;

use crate::{BlockPubSub, CacheError, CacheStats, LocalCache, RemoteCache, TrieNodeCache};

/// Local cache in front of a shared remote one.
///
/// Reads prefer the local tier and back-fill it from remote hits. Writes land
/// locally right away and reach the remote tier asynchronously.
pub struct HybridCache {
    local: LocalCache,
    remote: RemoteCache,
}

impl HybridCache {
    pub fn new(local: LocalCache, remote: RemoteCache) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }
}

impl TrieNodeCache for HybridCache {
    fn get(&self, key: &H256) -> Option<Vec<u8>> {
        if let Some(value) = self.local.get(key) {
            return Some(value);
        }
        let value = self.remote.get(key)?;
        self.local.set(*key, value.clone());
        Some(value)
    }

    fn set(&self, key: H256, value: Vec<u8>) {
        self.local.set(key, value.clone());
        self.remote.set_async(key, value);
    }

    fn has(&self, key: &H256) -> Option<Vec<u8>> {
        self.local.has(key).or_else(|| self.remote.has(key))
    }

    fn save_to_file(&self, dir: &Path, concurrency: usize) -> Result<(), CacheError> {
        self.local.save_to_file(dir, concurrency)
    }

    fn update_stats(&self) -> Option<CacheStats> {
        self.local.update_stats()
    }

    fn close(&self) -> Result<(), CacheError> {
        self.local.close()?;
        self.remote.close()
    }

    fn as_pubsub(&self) -> Option<&dyn BlockPubSub> {
        Some(&self.remote)
    }
}
