use std::{collections::BTreeMap, sync::Arc, time::Instant};

use ethereum_types::H256;
use eyre::{OptionExt, WrapErr, bail};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{info, warn};
use triedb::{NodeDatabase, NodeInfo};
use triedb_cache::new_trie_node_cache;
use triedb_storage::{InMemoryStore, KeyValueStore, StoreNodeReader};
use triedb_sync::{SyncBloom, SyncResult, TrieSync};
use triedb_trie::{InMemoryNodeStore, NodeReader, Trie};

use crate::{
    cli::{Options, Subcommand},
    initializers::{init_database, load_cache_config},
};

impl Subcommand {
    pub fn run(self, opts: &Options) -> eyre::Result<()> {
        match self {
            Subcommand::Populate {
                entries,
                cap_mib,
                seed,
                stats,
                metrics,
            } => {
                let (db, _) = init_database(opts)?;
                let db = Arc::new(db);
                let root = with_periodic_cache_save(&db, || {
                    populate(&db, entries, seed, cap_mib * 1024 * 1024)
                })?;
                if stats {
                    print_depth_stats(&db, root)?;
                }
                if let Some(dir) = db.cache_config().fast_cache_file_dir.clone() {
                    if db.can_save_cache_to_file().is_ok() {
                        db.save_cache_to_file(&dir, 4)?;
                    }
                }
                if metrics {
                    db.update_metric_nodes()?;
                    println!("{}", db.metrics().gather_metrics()?);
                }
            }
            Subcommand::Sync {
                entries,
                batch,
                seed,
                bloom_mib,
            } => sync_random_trie(entries, batch, seed, bloom_mib)?,
            Subcommand::CacheInfo => {
                let config = load_cache_config(opts)?;
                println!("{}", toml::to_string_pretty(&config)?);
                match new_trie_node_cache(&config)? {
                    Some(cache) => {
                        match cache.update_stats() {
                            Some(stats) => println!("{stats:#?}"),
                            None => println!("No statistics for a {} cache", config.cache_type),
                        }
                        cache.close()?;
                    }
                    None => println!("Trie node cache disabled"),
                }
            }
            Subcommand::PublishBlock { message } => {
                let config = load_cache_config(opts)?;
                if !config.redis_publish_block_enable {
                    bail!("Block publishing is disabled, pass --cache.redis-publish-block");
                }
                let cache = new_trie_node_cache(&config)?.ok_or_eyre("Trie node cache disabled")?;
                let Some(pubsub) = cache.as_pubsub() else {
                    bail!("A {} cache has no remote tier to publish to", config.cache_type);
                };
                pubsub.publish_block(&message)?;
                info!(%message, "Published block notification");
                cache.close()?;
            }
            Subcommand::SubscribeBlock { count } => {
                let config = load_cache_config(opts)?;
                if !config.redis_subscribe_block_enable {
                    bail!("Block subscription is disabled, pass --cache.redis-subscribe-block");
                }
                let cache = new_trie_node_cache(&config)?.ok_or_eyre("Trie node cache disabled")?;
                let Some(pubsub) = cache.as_pubsub() else {
                    bail!("A {} cache has no remote tier to subscribe to", config.cache_type);
                };
                let receiver = pubsub.subscribe_block()?;
                let mut received = 0;
                while received < count {
                    let Ok(message) = receiver.recv() else {
                        warn!(received, "Block subscription closed early");
                        break;
                    };
                    println!("{message}");
                    received += 1;
                }
                pubsub.unsubscribe_block()?;
                cache.close()?;
            }
        }
        Ok(())
    }
}

/// Runs `work` while the cache is saved in the background, if the
/// configuration asks for periodic saving.
fn with_periodic_cache_save<T>(
    db: &NodeDatabase,
    work: impl FnOnce() -> eyre::Result<T>,
) -> eyre::Result<T> {
    let config = db.cache_config().clone();
    if !config.periodic_save_enabled() || db.cache().is_none() {
        return work();
    }
    let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);
    std::thread::scope(|scope| {
        scope.spawn(|| db.save_cache_periodically(&config, &stop_rx));
        let result = work();
        // Disconnecting stops the saver
        drop(stop_tx);
        result
    })
}

fn random_entries(entries: usize, seed: u64) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..entries)
        .map(|_| {
            let key: [u8; 32] = rng.r#gen();
            let value: [u8; 20] = rng.r#gen();
            (key.to_vec(), value.to_vec())
        })
        .collect()
}

/// Stages a random trie, optionally caps the staging area and commits.
/// Returns the root after checking every entry reads back.
fn populate(db: &Arc<NodeDatabase>, entries: usize, seed: u64, cap: u64) -> eyre::Result<H256> {
    let kv = random_entries(entries, seed);
    let start = Instant::now();
    let mut trie = Trie::new(db.clone());
    for (key, value) in &kv {
        trie.insert(key.clone(), value.clone())?;
    }
    let root = trie.commit(db.as_ref())?;
    db.reference_root(root)?;
    let (staged, _) = db.size()?;
    info!(%root, entries, staged_bytes = staged, elapsed = ?start.elapsed(), "Staged trie");

    if cap > 0 {
        db.cap(cap)?;
    }
    db.commit(root, true, 0)?;

    let reader: Arc<dyn NodeReader> = db.clone();
    let trie = Trie::open(reader, root);
    for (key, value) in &kv {
        if trie.get(key)?.as_ref() != Some(value) {
            bail!("Entry {} does not read back after commit", hex::encode(key));
        }
    }
    info!(%root, "Every entry reads back from disk");
    Ok(root)
}

fn print_depth_stats(db: &NodeDatabase, root: H256) -> eyre::Result<()> {
    let (sender, receiver) = crossbeam::channel::unbounded::<NodeInfo>();
    db.collect_children_stats(root, 0, &sender)?;
    drop(sender);

    let mut nodes = 0usize;
    let mut leaves_by_depth = BTreeMap::<usize, usize>::new();
    for info in receiver {
        nodes += 1;
        if info.depth > 0 {
            *leaves_by_depth.entry(info.depth).or_default() += 1;
        }
    }
    println!("nodes: {nodes}");
    for (depth, leaves) in leaves_by_depth {
        println!("depth {depth:>2}: {leaves} leaf nodes");
    }
    Ok(())
}

fn sync_random_trie(entries: usize, batch: usize, seed: u64, bloom_mib: usize) -> eyre::Result<()> {
    let kv = random_entries(entries, seed);
    let source = InMemoryNodeStore::new_empty();
    let mut trie = Trie::new(Arc::new(source.clone()));
    for (key, value) in &kv {
        trie.insert(key.clone(), value.clone())?;
    }
    let root = trie.commit(&source)?;

    let dest = InMemoryStore::open();
    let bloom = (bloom_mib > 0).then(|| Arc::new(SyncBloom::new(bloom_mib)));
    let mut sync = TrieSync::new(root, Arc::new(dest.clone()), None, bloom, None)?;

    let start = Instant::now();
    let mut written = 0;
    let mut rounds = 0;
    while sync.pending() > 0 {
        let hashes = sync.missing(batch);
        if hashes.is_empty() {
            warn!(pending = sync.pending(), "Sync stalled with requests in flight");
            break;
        }
        let mut results = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let data = source
                .node(hash)?
                .ok_or_else(|| eyre::eyre!("Source is missing node {hash:#x}"))?;
            results.push(SyncResult { hash, data });
        }
        sync.process(&results)?;

        let mut write_batch = dest.new_batch();
        written += sync.commit(write_batch.as_mut())?;
        write_batch.write()?;
        rounds += 1;
        if rounds % 100 == 0 {
            info!(
                written,
                pending = sync.pending(),
                progress = sync.calc_progress_percentage(),
                "Syncing"
            );
        }
    }

    let reader = StoreNodeReader::new(Arc::new(dest.clone()));
    let synced = Trie::open(Arc::new(reader), root)
        .entries()
        .wrap_err("Failed to read back the synced trie")?;
    if synced.len() != kv.len() {
        bail!("Synced trie has {} entries, expected {}", synced.len(), kv.len());
    }
    info!(
        %root,
        written,
        rounds,
        elapsed = ?start.elapsed(),
        bloom_faults = sync.metrics().bloom_faults.get(),
        "Sync finished"
    );
    Ok(())
}
