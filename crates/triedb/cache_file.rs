use std::{
    path::Path,
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use rand::Rng;
use tracing::{debug, error, info, warn};
use triedb_cache::TrieNodeCacheConfig;

use crate::{DatabaseError, NodeDatabase};

impl NodeDatabase {
    /// Fails when there is no cache to save or a save is already running.
    pub fn can_save_cache_to_file(&self) -> Result<(), DatabaseError> {
        if self.cache().is_none() {
            return Err(DatabaseError::CacheDisabled);
        }
        if self.saving_cache.load(Ordering::Acquire) {
            return Err(DatabaseError::CacheSaveInProgress);
        }
        Ok(())
    }

    /// Saves the trie node cache to `dir` so the next start can reuse it.
    pub fn save_cache_to_file(&self, dir: &Path, concurrency: usize) -> Result<(), DatabaseError> {
        let Some(cache) = self.cache() else {
            return Err(DatabaseError::CacheDisabled);
        };
        if self
            .saving_cache
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DatabaseError::CacheSaveInProgress);
        }

        let start = Instant::now();
        info!(dir = %dir.display(), concurrency, "Start saving cache to file");
        let result = cache.save_to_file(dir, concurrency);
        match &result {
            Ok(()) => info!(
                dir = %dir.display(),
                elapsed = ?start.elapsed(),
                "Successfully saved cache to file"
            ),
            Err(err) => error!(
                dir = %dir.display(),
                elapsed = ?start.elapsed(),
                %err,
                "Failed to save cache to file"
            ),
        }
        self.saving_cache.store(false, Ordering::Release);
        result.map_err(DatabaseError::from)
    }

    /// Saves the cache to `config.fast_cache_file_dir` every
    /// `config.fast_cache_save_period` until `stop` fires or is dropped.
    /// The first save happens after a random 50-100% of the period.
    pub fn save_cache_periodically(&self, config: &TrieNodeCacheConfig, stop: &Receiver<()>) {
        let Some(dir) = config.fast_cache_file_dir.as_deref() else {
            warn!("Periodic cache saving requested without a cache directory");
            return;
        };
        let period = config.fast_cache_save_period;
        if period.is_zero() {
            warn!("Periodic cache saving requested with a zero period");
            return;
        }
        let mut delay = first_save_delay(period, rand::thread_rng().gen_range(0.5..1.0));
        info!(after = ?delay, "First periodic cache saving will be triggered");

        loop {
            match stop.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
            delay = period;
            if let Err(err) = self.can_save_cache_to_file() {
                warn!(%err, "Failed to trigger periodic cache saving");
                continue;
            }
            if let Err(err) = self.save_cache_to_file(dir, 1) {
                debug!(%err, "Periodic cache saving failed, retrying next period");
            }
        }
    }
}

fn first_save_delay(period: Duration, factor: f64) -> Duration {
    period.mul_f64(factor.clamp(0.5, 1.0))
}
