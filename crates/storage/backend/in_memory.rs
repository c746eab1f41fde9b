use crate::api::{KeyValueStore, PrefixResult, WriteBatch};
use crate::error::StoreError;
use crate::metrics::StoreMetrics;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default)]
struct Inner {
    table: RwLock<Table>,
    closed: AtomicBool,
    metrics: StoreMetrics,
}

/// Ordered in-memory store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.inner.metrics
    }

    /// Number of stored keys
    pub fn len(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self.read_table()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// All stored keys in order
    pub fn keys(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        self.check_open()?;
        Ok(self.read_table()?.keys().cloned().collect())
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn read_table(&self) -> Result<std::sync::RwLockReadGuard<'_, Table>, StoreError> {
        self.inner.table.read().map_err(|_| StoreError::LockError)
    }

    fn apply(&self, writes: &[(Vec<u8>, Vec<u8>)]) -> Result<(), StoreError> {
        self.check_open()?;
        let mut table = self
            .inner
            .table
            .write()
            .map_err(|_| StoreError::LockError)?;
        let mut bytes = 0;
        for (key, value) in writes {
            bytes += key.len() + value.len();
            table.insert(key.clone(), value.clone());
        }
        self.inner
            .metrics
            .record_write(writes.len() as u64, bytes as u64);
        Ok(())
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        self.inner.metrics.record_read();
        Ok(self.read_table()?.get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.check_open()?;
        self.inner.metrics.record_read();
        Ok(self.read_table()?.contains_key(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.apply(&[(key.to_vec(), value.to_vec())])
    }

    fn new_batch(&self) -> Box<dyn WriteBatch> {
        Box::new(InMemoryBatch {
            store: self.clone(),
            writes: Vec::new(),
            size: 0,
        })
    }

    fn prefix_iterator(
        &self,
        prefix: &[u8],
        start: &[u8],
    ) -> Result<Box<dyn Iterator<Item = PrefixResult> + '_>, StoreError> {
        self.check_open()?;
        let mut from = prefix.to_vec();
        from.extend_from_slice(start);
        let prefix = prefix.to_vec();

        // Snapshot so the iterator does not hold the lock
        let results: Vec<PrefixResult> = self
            .read_table()?
            .range(from..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(k, v)| Ok((k.clone().into_boxed_slice(), v.clone().into_boxed_slice())))
            .collect();
        Ok(Box::new(results.into_iter()))
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

pub struct InMemoryBatch {
    store: InMemoryStore,
    writes: Vec<(Vec<u8>, Vec<u8>)>,
    size: usize,
}

impl WriteBatch for InMemoryBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.size += key.len() + value.len();
        self.writes.push((key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn value_size(&self) -> usize {
        self.size
    }

    fn write(&mut self) -> Result<(), StoreError> {
        self.store.apply(&self.writes)?;
        self.store.inner.metrics.record_batch();
        Ok(())
    }

    fn reset(&mut self) {
        self.writes.clear();
        self.size = 0;
    }
}
