use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use ethereum_types::H256;
use moka::{notification::RemovalCause, sync::Cache};
use tracing::{debug, info, warn};

use crate::{CacheError, CacheStats, TrieNodeCache, TrieNodeCacheConfig};

const SHARD_PREFIX: &str = "data.";
const SHARD_SUFFIX: &str = ".bin";

/// Entries as written to a snapshot shard.
type ShardEntries = Vec<([u8; 32], Vec<u8>)>;

#[derive(Debug, Default)]
struct Counters {
    get_calls: AtomicU64,
    set_calls: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    collisions: AtomicU64,
    evictions: AtomicU64,
}

/// In-process cache bounded by a byte budget.
///
/// Can be cloned freely.
#[derive(Clone)]
pub struct LocalCache {
    cache: Cache<H256, Vec<u8>>,
    counters: Arc<Counters>,
}

impl LocalCache {
    pub fn new(max_bytes: u64) -> Self {
        let counters = Arc::new(Counters::default());
        let listener_counters = counters.clone();
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &H256, value: &Vec<u8>| -> u32 {
                u32::try_from(32 + value.len()).unwrap_or(u32::MAX)
            })
            .eviction_listener(move |_key, _value, cause| match cause {
                RemovalCause::Size => {
                    listener_counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Replaced => {
                    listener_counters.collisions.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Expired | RemovalCause::Explicit => {}
            })
            .build();
        Self { cache, counters }
    }

    /// Builds the local tier described by `config`, loading the previous
    /// snapshot when one exists. Returns `None` for a zero budget.
    pub fn from_config(config: &TrieNodeCacheConfig) -> Result<Option<Self>, CacheError> {
        let max_bytes = config.local_cache_byte_limit();
        if max_bytes == 0 {
            return Ok(None);
        }
        let cache = Self::new(max_bytes);
        if let Some(dir) = &config.fast_cache_file_dir {
            if dir.is_dir() {
                let loaded = cache.load_from_dir(dir)?;
                info!(dir = %dir.display(), entries = loaded, "Loaded trie node cache from file");
            }
        }
        info!(size_mib = config.local_cache_size_mib(), "Initialized local trie node cache");
        Ok(Some(cache))
    }

    /// Inserts every entry of the snapshot shards found in `dir`.
    pub fn load_from_dir(&self, dir: &Path) -> Result<usize, CacheError> {
        let mut loaded = 0;
        for shard in shard_files(dir)? {
            let reader = BufReader::new(File::open(&shard)?);
            let entries: ShardEntries = bincode::deserialize_from(reader)?;
            loaded += entries.len();
            for (key, value) in entries {
                self.cache.insert(H256(key), value);
            }
        }
        Ok(loaded)
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl TrieNodeCache for LocalCache {
    fn get(&self, key: &H256) -> Option<Vec<u8>> {
        self.counters.get_calls.fetch_add(1, Ordering::Relaxed);
        let value = self.cache.get(key);
        let counter = if value.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    fn set(&self, key: H256, value: Vec<u8>) {
        self.counters.set_calls.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(key, value);
    }

    fn has(&self, key: &H256) -> Option<Vec<u8>> {
        self.cache.get(key)
    }

    fn save_to_file(&self, dir: &Path, concurrency: usize) -> Result<(), CacheError> {
        let start = Instant::now();
        let tmp_dir = tmp_dir_for(dir);
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        let entries: ShardEntries = self
            .cache
            .iter()
            .map(|(key, value)| (key.0, value))
            .collect();
        let shard_len = entries.len().div_ceil(concurrency.max(1)).max(1);

        std::thread::scope(|scope| {
            let handles: Vec<_> = entries
                .chunks(shard_len)
                .enumerate()
                .map(|(index, shard)| {
                    let path = tmp_dir.join(format!("{SHARD_PREFIX}{index}{SHARD_SUFFIX}"));
                    scope.spawn(move || write_shard(&path, shard))
                })
                .collect();
            handles
                .into_iter()
                .try_for_each(|handle| handle.join().map_err(|_| CacheError::SnapshotWorker)?)
        })?;

        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::rename(&tmp_dir, dir)?;
        debug!(
            dir = %dir.display(),
            entries = entries.len(),
            elapsed = ?start.elapsed(),
            "Saved trie node cache snapshot"
        );
        Ok(())
    }

    fn update_stats(&self) -> Option<CacheStats> {
        self.cache.run_pending_tasks();
        Some(CacheStats {
            entries: self.cache.entry_count(),
            bytes_size: self.cache.weighted_size(),
            get_calls: self.counters.get_calls.load(Ordering::Relaxed),
            set_calls: self.counters.set_calls.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            collisions: self.counters.collisions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        })
    }

    fn close(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        Ok(())
    }
}

fn tmp_dir_for(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dir.with_file_name(name)
}

fn shard_files(dir: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_shard = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(SHARD_PREFIX) && name.ends_with(SHARD_SUFFIX));
        if is_shard {
            shards.push(path);
        } else {
            warn!(path = %path.display(), "Ignoring unexpected file in cache directory");
        }
    }
    shards.sort();
    Ok(shards)
}

fn write_shard(path: &Path, shard: &[([u8; 32], Vec<u8>)]) -> Result<(), CacheError> {
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, shard)?;
    Ok(())
}
