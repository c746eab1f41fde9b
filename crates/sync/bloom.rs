use ethereum_types::H256;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};
use tracing::info;
use triedb_storage::{CodeKey, KeyValueStore, StoreError};

const NUM_PROBES: usize = 3;

/// Lock-free bloom filter over node and code hashes already on disk.
///
/// A hit only means the hash *might* be stored, callers confirm with the
/// store. A miss is trusted, so the filter must be seeded from the store
/// before use and fed with every hash the sync writes.
///
/// Hashes are uniformly distributed, so the probes are taken straight from
/// the hash bytes instead of rehashing.
pub struct SyncBloom {
    bits: Box<[AtomicU64]>,
    mask: u64,
    ones: AtomicU64,
}

impl SyncBloom {
    /// Creates a filter using roughly `size_mib` MiB, rounded down to a
    /// power of two bits.
    pub fn new(size_mib: usize) -> Self {
        let requested = (size_mib.max(1) as u64) * 8 * 1024 * 1024;
        let num_bits = 1u64 << (63 - requested.leading_zeros());
        let words = (num_bits / 64) as usize;
        let mut v = Vec::with_capacity(words);
        for _ in 0..words {
            v.push(AtomicU64::new(0));
        }
        Self {
            bits: v.into_boxed_slice(),
            mask: num_bits - 1,
            ones: AtomicU64::new(0),
        }
    }

    /// Seeds the filter with every node and code key in `store`.
    /// Returns the number of hashes added.
    pub fn init_from(&self, store: &dyn KeyValueStore) -> Result<usize, StoreError> {
        let start = Instant::now();
        let mut added = 0;
        for entry in store.prefix_iterator(&[], &[])? {
            let (key, _) = entry?;
            let hash = match key.len() {
                32 => H256::from_slice(&key),
                _ => match CodeKey::parse(&key) {
                    Some(hash) => hash,
                    None => continue,
                },
            };
            self.add(&hash);
            added += 1;
        }
        info!(
            items = added,
            error_rate = self.error_rate(),
            elapsed = ?start.elapsed(),
            "Initialized state bloom"
        );
        Ok(added)
    }

    #[inline]
    pub fn add(&self, hash: &H256) {
        for k in 0..NUM_PROBES {
            let (word, mask) = self.probe(hash, k);
            let prev = self.bits[word].fetch_or(mask, Ordering::Relaxed);
            if prev & mask == 0 {
                self.ones.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns `false` only if `hash` was never added.
    #[inline]
    pub fn contains(&self, hash: &H256) -> bool {
        (0..NUM_PROBES).all(|k| {
            let (word, mask) = self.probe(hash, k);
            self.bits[word].load(Ordering::Relaxed) & mask != 0
        })
    }

    /// Estimated false positive rate given the current fill.
    pub fn error_rate(&self) -> f64 {
        let fill = self.ones.load(Ordering::Relaxed) as f64 / (self.mask + 1) as f64;
        fill.powi(NUM_PROBES as i32)
    }

    /// Probe `k` reads bytes `8k..8k+8` of the hash.
    #[inline]
    fn probe(&self, hash: &H256, k: usize) -> (usize, u64) {
        let offset = k * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&hash.as_bytes()[offset..offset + 8]);
        let bit_index = u64::from_le_bytes(raw) & self.mask;
        ((bit_index / 64) as usize, 1u64 << (bit_index % 64))
    }
}

impl std::fmt::Debug for SyncBloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBloom")
            .field("size_bits", &(self.mask + 1))
            .field("num_probes", &NUM_PROBES)
            .field("ones", &self.ones.load(Ordering::Relaxed))
            .finish()
    }
}
