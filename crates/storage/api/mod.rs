//! # Key-value store API
//!
//! Thin byte-level interface consumed by the node database and the trie
//! sync scheduler:
//!
//! - Point reads ([`KeyValueStore::get`], [`KeyValueStore::has`]) and writes.
//! - Write batches ([`WriteBatch`]) that buffer puts until
//!   [`WriteBatch::write`], with a reported size so callers can flush at the
//!   store's ideal batch size.
//! - Prefix iteration in key order.

use crate::error::StoreError;
use std::fmt::Debug;

/// Type alias for the result of a prefix iterator.
pub type PrefixResult = Result<(Box<[u8]>, Box<[u8]>), StoreError>;

/// Batch size, in bytes, above which batches should be written out.
pub const IDEAL_BATCH_SIZE: usize = 100 * 1024;

/// Minimal set of operations required from a persistent store.
pub trait KeyValueStore: Debug + Send + Sync {
    /// Retrieves a value by key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Reports whether the key is present.
    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Stores a single key-value pair.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Creates a new, empty write batch.
    fn new_batch(&self) -> Box<dyn WriteBatch>;

    /// Iterates, in key order, over every key starting with `prefix` that is
    /// not smaller than `prefix ++ start`.
    fn prefix_iterator(
        &self,
        prefix: &[u8],
        start: &[u8],
    ) -> Result<Box<dyn Iterator<Item = PrefixResult> + '_>, StoreError>;

    /// Batch size above which callers should write out their batches.
    fn ideal_batch_size(&self) -> usize {
        IDEAL_BATCH_SIZE
    }

    /// Releases the store. Every later operation fails with [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}

/// Buffered writes. Nothing reaches the store before [`write`](WriteBatch::write).
pub trait WriteBatch: Send {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Amount of data queued, keys plus values.
    fn value_size(&self) -> usize;

    fn write(&mut self) -> Result<(), StoreError>;

    /// Drops every queued write.
    fn reset(&mut self);
}

/// Writes and resets `batch` when its size exceeds `threshold`.
/// Returns whether a write happened.
pub fn write_batch_over_threshold(
    batch: &mut dyn WriteBatch,
    threshold: usize,
) -> Result<bool, StoreError> {
    if batch.value_size() <= threshold {
        return Ok(false);
    }
    batch.write()?;
    batch.reset();
    Ok(true)
}
