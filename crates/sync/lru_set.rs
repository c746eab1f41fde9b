use ethereum_types::H256;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

const DEFAULT_CAPACITY: usize = 1_000_000;

/// Exact set of recently written hashes.
///
/// When configured it replaces the bloom and disk lookups entirely: a hash
/// it does not hold is fetched again. Meant for bulk migrations where the
/// destination starts empty and every write goes through the sync.
#[derive(Debug)]
pub struct SyncLru {
    hashes: Mutex<LruCache<H256, ()>>,
}

impl SyncLru {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            hashes: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn add(&self, hash: H256) {
        self.hashes.lock().put(hash, ());
    }

    pub fn contains(&self, hash: &H256) -> bool {
        self.hashes.lock().get(hash).is_some()
    }

    pub fn len(&self) -> usize {
        self.hashes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SyncLru {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
