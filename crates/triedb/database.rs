use std::{
    sync::{
        Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::AtomicBool,
    },
    time::Instant,
};

use crossbeam::channel::{Receiver, Sender, bounded};
use ethereum_types::H256;
use tracing::{debug, error, info, trace};
use triedb_cache::{TrieNodeCache, TrieNodeCacheConfig, new_trie_node_cache};
use triedb_storage::{KeyValueStore, PreimageKey, WriteBatch, write_batch_over_threshold};
use triedb_trie::{Node, NodeReader, NodeWriter, TrieError};

use crate::{
    error::DatabaseError,
    metrics::TrieDbMetrics,
    staging::{HASH_LENGTH, Staging, StoredNode},
};

/// Upper bound on the number of encoded nodes buffered between the commit
/// workers and the batch writer.
pub const COMMIT_RESULT_CHANNEL_LIMIT: usize = 100 * 10_000;

/// Preimages are written out by [`NodeDatabase::cap`] past this size.
pub const PREIMAGE_FLUSH_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Leaf depth report produced by [`NodeDatabase::collect_children_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeInfo {
    /// Depth of a leaf, 0 for inner nodes
    pub depth: usize,
    /// Set by callers to mark the end of a walk
    pub finished: bool,
}

/// Write-deferring store of trie nodes in front of a [`KeyValueStore`].
///
/// Nodes are staged in memory together with a reference graph rooted at the
/// zero-hash sentinel. Unreferenced subtrees are released by
/// [`dereference`](Self::dereference), the oldest staged nodes are flushed by
/// [`cap`](Self::cap) under memory pressure and whole tries are persisted by
/// [`commit`](Self::commit), which writes the root last.
pub struct NodeDatabase {
    disk: Arc<dyn KeyValueStore>,
    staging: RwLock<Staging>,
    /// Held exclusively by dereference, shared by cap, commit and readers
    /// that walk staged subtrees.
    gc_lock: RwLock<()>,
    /// Serialises cap and commit.
    flush_lock: Mutex<()>,
    cache: Option<Arc<dyn TrieNodeCache>>,
    cache_config: TrieNodeCacheConfig,
    pub(crate) saving_cache: AtomicBool,
    metrics: TrieDbMetrics,
}

impl std::fmt::Debug for NodeDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDatabase")
            .field("disk", &self.disk)
            .field("cache_enabled", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl NodeDatabase {
    /// Creates a database without a trie node cache.
    pub fn new(disk: Arc<dyn KeyValueStore>) -> Result<Self, DatabaseError> {
        Self::with_cache(disk, None)
    }

    /// Creates a database with the trie node cache described by `config`.
    pub fn with_cache_config(
        disk: Arc<dyn KeyValueStore>,
        config: TrieNodeCacheConfig,
    ) -> Result<Self, DatabaseError> {
        let cache = new_trie_node_cache(&config)?;
        let mut db = Self::with_cache(disk, cache)?;
        db.cache_config = config;
        Ok(db)
    }

    /// Creates a database sharing an existing trie node cache.
    pub fn with_cache(
        disk: Arc<dyn KeyValueStore>,
        cache: Option<Arc<dyn TrieNodeCache>>,
    ) -> Result<Self, DatabaseError> {
        Ok(Self {
            disk,
            staging: RwLock::new(Staging::default()),
            gc_lock: RwLock::new(()),
            flush_lock: Mutex::new(()),
            cache,
            cache_config: TrieNodeCacheConfig::default(),
            saving_cache: AtomicBool::new(false),
            metrics: TrieDbMetrics::new()?,
        })
    }

    pub fn disk(&self) -> &Arc<dyn KeyValueStore> {
        &self.disk
    }

    pub fn cache(&self) -> Option<&Arc<dyn TrieNodeCache>> {
        self.cache.as_ref()
    }

    pub fn cache_config(&self) -> &TrieNodeCacheConfig {
        &self.cache_config
    }

    pub fn metrics(&self) -> &TrieDbMetrics {
        &self.metrics
    }

    /// Blocks dereferencing for as long as the guard lives.
    pub fn lock_gc(&self) -> Result<RwLockReadGuard<'_, ()>, DatabaseError> {
        self.gc_lock.read().map_err(|_| DatabaseError::LockError)
    }

    fn read_staging(&self) -> Result<RwLockReadGuard<'_, Staging>, DatabaseError> {
        self.staging.read().map_err(|_| DatabaseError::LockError)
    }

    fn write_staging(&self) -> Result<RwLockWriteGuard<'_, Staging>, DatabaseError> {
        self.staging.write().map_err(|_| DatabaseError::LockError)
    }

    fn lock_flush(&self) -> Result<MutexGuard<'_, ()>, DatabaseError> {
        self.flush_lock.lock().map_err(|_| DatabaseError::LockError)
    }

    /// Stages a collapsed trie node. Nodes already staged are left untouched.
    pub fn insert(&self, hash: H256, len_encoded: u16, node: Node) -> Result<(), DatabaseError> {
        self.write_staging()?
            .insert(hash, len_encoded, StoredNode::Collapsed(node));
        Ok(())
    }

    /// Stages an opaque pre-encoded payload under `hash`.
    pub fn insert_blob(&self, hash: H256, blob: Vec<u8>) -> Result<(), DatabaseError> {
        let size = u16::try_from(blob.len()).unwrap_or(u16::MAX);
        self.write_staging()?
            .insert(hash, size, StoredNode::Raw(blob));
        Ok(())
    }

    pub fn insert_preimage(&self, hash: H256, preimage: &[u8]) -> Result<(), DatabaseError> {
        self.write_staging()?.insert_preimage(hash, preimage);
        Ok(())
    }

    fn cached_node(&self, hash: &H256) -> Option<Vec<u8>> {
        let enc = self.cache.as_ref()?.get(hash)?;
        self.metrics.clean_hit.inc();
        self.metrics.clean_read.inc_by(enc.len() as u64);
        Some(enc)
    }

    fn set_cached_node(&self, hash: H256, enc: Vec<u8>) {
        if let Some(cache) = &self.cache {
            self.metrics.clean_write.inc_by(enc.len() as u64);
            cache.set(hash, enc);
        }
    }

    /// Encoded node for `hash`, looked up in the cache, then staging, then
    /// disk. Disk hits are copied into the cache.
    pub fn node(&self, hash: H256) -> Result<Option<Vec<u8>>, DatabaseError> {
        if hash.is_zero() {
            return Err(DatabaseError::ZeroHashNode);
        }
        if let Some(enc) = self.cached_node(&hash) {
            return Ok(Some(enc));
        }
        if let Some(node) = self.read_staging()?.nodes.get(&hash) {
            return Ok(Some(node.rlp()));
        }
        let enc = self.disk.get(hash.as_bytes())?;
        if let Some(enc) = &enc {
            self.set_cached_node(hash, enc.clone());
            self.metrics.clean_miss.inc();
        }
        Ok(enc)
    }

    /// Decoded form of the node stored under `hash`, wherever it lives.
    fn decoded_node(&self, hash: H256) -> Result<Option<Node>, DatabaseError> {
        if let Some(enc) = self.cached_node(&hash) {
            match Node::decode(&enc) {
                Ok(node) => return Ok(Some(node)),
                Err(err) => error!(?hash, %err, "Node from trie node cache fails to be decoded"),
            }
        }
        if let Some(cached) = self.read_staging()?.nodes.get(&hash) {
            return match &cached.node {
                Some(StoredNode::Collapsed(node)) => Ok(Some(node.clone())),
                Some(StoredNode::Raw(blob)) => Ok(Some(Node::decode(blob)?)),
                None => Ok(None),
            };
        }
        let Some(enc) = self.disk.get(hash.as_bytes())? else {
            return Ok(None);
        };
        self.set_cached_node(hash, enc.clone());
        self.metrics.clean_miss.inc();
        Ok(Some(Node::decode(&enc)?))
    }

    pub fn does_exist_cached_node(&self, hash: H256) -> Result<bool, DatabaseError> {
        Ok(self.read_staging()?.nodes.contains_key(&hash))
    }

    /// Whether `hash` is in the trie node cache or on disk.
    pub fn does_exist_node_in_persistent(&self, hash: H256) -> Result<bool, DatabaseError> {
        if self.cached_node(&hash).is_some() {
            return Ok(true);
        }
        Ok(self.disk.get(hash.as_bytes())?.is_some())
    }

    pub fn preimage(&self, hash: H256) -> Result<Option<Vec<u8>>, DatabaseError> {
        if let Some(preimage) = self.read_staging()?.preimages.get(&hash) {
            return Ok(Some(preimage.clone()));
        }
        Ok(self.disk.get(PreimageKey::new(&hash).as_ref())?)
    }

    /// Every staged hash except the sentinel. Expensive, meant for tests and
    /// diagnostics.
    pub fn nodes(&self) -> Result<Vec<H256>, DatabaseError> {
        Ok(self
            .read_staging()?
            .nodes
            .keys()
            .filter(|hash| !hash.is_zero())
            .copied()
            .collect())
    }

    /// Hash references held directly by the node under `hash`.
    pub fn node_children(&self, hash: H256) -> Result<Vec<H256>, DatabaseError> {
        if hash.is_zero() {
            return Err(DatabaseError::ZeroHashNode);
        }
        Ok(self
            .decoded_node(hash)?
            .map(|node| direct_child_hashes(&node))
            .unwrap_or_default())
    }

    /// Anchors a trie root to the sentinel so it survives garbage collection.
    pub fn reference_root(&self, root: H256) -> Result<(), DatabaseError> {
        self.reference(root, H256::zero())
    }

    pub fn reference(&self, child: H256, parent: H256) -> Result<(), DatabaseError> {
        self.write_staging()?.reference(child, parent);
        Ok(())
    }

    /// Releases a root previously anchored with
    /// [`reference_root`](Self::reference_root), freeing every staged node
    /// that is no longer referenced.
    pub fn dereference(&self, root: H256) -> Result<(), DatabaseError> {
        if root.is_zero() {
            error!("Attempted to dereference the trie cache meta root");
            return Ok(());
        }
        let _gc = self.gc_lock.write().map_err(|_| DatabaseError::LockError)?;
        let mut staging = self.write_staging()?;

        let (nodes, storage, start) = (staging.nodes.len(), staging.nodes_size, Instant::now());
        staging.dereference(root, H256::zero());

        let removed_nodes = nodes - staging.nodes.len();
        let removed_size = storage - staging.nodes_size;
        staging.gc_nodes += removed_nodes as u64;
        staging.gc_size += removed_size;
        staging.gc_time += start.elapsed();
        self.metrics
            .record_gc(start.elapsed(), removed_nodes, removed_size);

        debug!(
            nodes = removed_nodes,
            size = removed_size,
            time = ?start.elapsed(),
            gcnodes = staging.gc_nodes,
            gcsize = staging.gc_size,
            gctime = ?staging.gc_time,
            livenodes = staging.nodes.len(),
            livesize = staging.nodes_size,
            "Dereferenced trie from memory database"
        );
        Ok(())
    }

    fn write_preimages(
        &self,
        staging: &Staging,
        batch: &mut dyn WriteBatch,
    ) -> Result<(), DatabaseError> {
        if staging.preimages.is_empty() {
            return Ok(());
        }
        for (hash, preimage) in &staging.preimages {
            batch.put(PreimageKey::new(hash).as_ref(), preimage)?;
            write_batch_over_threshold(batch, self.disk.ideal_batch_size())?;
        }
        batch.write()?;
        batch.reset();
        Ok(())
    }

    /// Flushes the oldest staged nodes to disk until the staging footprint
    /// drops to `limit` bytes. Flushed nodes stay readable through the cache
    /// and the disk. On error nothing is removed from staging.
    pub fn cap(&self, limit: u64) -> Result<(), DatabaseError> {
        let _flush = self.lock_flush()?;
        let _gc = self.lock_gc()?;

        let start = Instant::now();
        let (nodes, node_size, preimages_size, flush_preimages, num_preimages, last_flushed) = {
            let staging = self.read_staging()?;
            let mut size = staging.memory_footprint();
            let mut batch = self.disk.new_batch();

            let flush_preimages = staging.preimages_size > PREIMAGE_FLUSH_THRESHOLD;
            if flush_preimages {
                self.write_preimages(&staging, batch.as_mut())?;
            }

            let mut oldest = staging.oldest;
            let mut last_flushed = H256::zero();
            while size > limit && !oldest.is_zero() {
                let Some(node) = staging.nodes.get(&oldest) else {
                    break;
                };
                let enc = node.rlp();
                batch.put(oldest.as_bytes(), &enc)?;
                write_batch_over_threshold(batch.as_mut(), self.disk.ideal_batch_size())?;
                self.set_cached_node(oldest, enc);
                size = size.saturating_sub(3 * HASH_LENGTH + u64::from(node.size));
                last_flushed = oldest;
                oldest = node.flush_next;
            }
            if let Err(err) = batch.write() {
                error!(%err, "Failed to write flush list to disk");
                return Err(err.into());
            }
            (
                staging.nodes.len(),
                staging.nodes_size,
                staging.preimages_size,
                flush_preimages,
                if flush_preimages {
                    staging.preimages.len()
                } else {
                    0
                },
                last_flushed,
            )
        };

        let mut staging = self.write_staging()?;
        if flush_preimages {
            staging.clear_preimages();
        }
        staging.prune_flushed(last_flushed);

        let flushed_nodes = nodes.saturating_sub(staging.nodes.len());
        let flushed_size = node_size.saturating_sub(staging.nodes_size);
        staging.flush_nodes += flushed_nodes as u64;
        staging.flush_size += flushed_size;
        staging.flush_time += start.elapsed();
        self.metrics
            .record_flush(start.elapsed(), flushed_nodes, flushed_size);

        info!(
            nodes = flushed_nodes,
            size = flushed_size,
            preimages_size = preimages_size.saturating_sub(staging.preimages_size),
            time = ?start.elapsed(),
            flushnodes = staging.flush_nodes,
            flushsize = staging.flush_size,
            flushtime = ?staging.flush_time,
            livenodes = staging.nodes.len(),
            livesize = staging.nodes_size,
            preimages = num_preimages,
            "Persisted nodes from memory database by Cap"
        );
        Ok(())
    }

    /// Persists the trie under `root`, children strictly before the root,
    /// then drops it from staging. Every staged preimage is written as well.
    pub fn commit(&self, root: H256, report: bool, block_num: u64) -> Result<(), DatabaseError> {
        let _flush = self.lock_flush()?;
        let _gc = self.lock_gc()?;

        let commit_start = Instant::now();
        let (num_nodes, nodes_size, num_preimages) = {
            let staging = self.read_staging()?;
            let mut batch = self.disk.new_batch();
            self.write_preimages(&staging, batch.as_mut())?;
            let counts = (
                staging.nodes.len(),
                staging.nodes_size,
                staging.preimages.len(),
            );
            self.write_batch_nodes(&staging, root)?;
            counts
        };

        let mut staging = self.write_staging()?;
        staging.clear_preimages();

        let uncache_start = Instant::now();
        staging.uncache(root);
        let commit_end = Instant::now();

        let committed_nodes = num_nodes.saturating_sub(staging.nodes.len());
        let committed_size = nodes_size.saturating_sub(staging.nodes_size);
        self.metrics.record_commit(
            commit_end - commit_start,
            commit_end - uncache_start,
            committed_nodes,
            committed_size,
        );

        macro_rules! log_commit {
            ($level:ident) => {
                $level!(
                    block_num,
                    updated_nodes = committed_nodes,
                    updated_nodes_size = committed_size,
                    time = ?(commit_end - commit_start),
                    gcnodes = staging.gc_nodes,
                    gcsize = staging.gc_size,
                    gctime = ?staging.gc_time,
                    livenodes = staging.nodes.len(),
                    livesize = staging.nodes_size,
                    preimages = num_preimages,
                    "Persisted trie from memory database"
                )
            };
        }
        if report {
            log_commit!(info);
        } else {
            log_commit!(debug);
        }

        staging.reset_stats();
        Ok(())
    }

    /// Writes the staged subtree under `root`. One worker per child of the
    /// root walks its subtree in post-order and feeds a single batch writer;
    /// the root goes out last.
    fn write_batch_nodes(&self, staging: &Staging, root: H256) -> Result<(), DatabaseError> {
        let Some(root_node) = staging.nodes.get(&root) else {
            return Ok(());
        };
        let capacity = staging.nodes.len().clamp(1, COMMIT_RESULT_CHANNEL_LIMIT);
        let (sender, receiver) = bounded::<(H256, Vec<u8>)>(capacity);
        let mut batch = self.disk.new_batch();

        std::thread::scope(|scope| {
            for (index, child) in root_node.childs().into_iter().enumerate() {
                let sender = sender.clone();
                scope.spawn(move || {
                    trace!(index, "Concurrent commit started");
                    self.commit_subtree(staging, child, &sender);
                    trace!(index, "Concurrent commit finished");
                });
            }
            drop(sender);
            // Owning the receiver here releases blocked workers on error
            self.collect_commit_results(receiver, batch.as_mut())
        })?;

        let enc = root_node.rlp();
        batch.put(root.as_bytes(), &enc)?;
        if let Err(err) = batch.write() {
            error!(%err, "Failed to write trie to disk");
            return Err(err.into());
        }
        self.set_cached_node(root, enc);
        Ok(())
    }

    fn collect_commit_results(
        &self,
        receiver: Receiver<(H256, Vec<u8>)>,
        batch: &mut dyn WriteBatch,
    ) -> Result<(), DatabaseError> {
        let threshold = self.disk.ideal_batch_size();
        for (hash, enc) in receiver {
            batch.put(hash.as_bytes(), &enc)?;
            write_batch_over_threshold(batch, threshold)?;
        }
        Ok(())
    }

    /// Emits the staged subtree under `hash` in post-order. Returns `false`
    /// once the writer is gone.
    fn commit_subtree(
        &self,
        staging: &Staging,
        hash: H256,
        sender: &Sender<(H256, Vec<u8>)>,
    ) -> bool {
        let Some(node) = staging.nodes.get(&hash) else {
            return true;
        };
        for child in node.childs() {
            if !self.commit_subtree(staging, child, sender) {
                return false;
            }
        }
        let enc = node.rlp();
        if sender.send((hash, enc.clone())).is_err() {
            return false;
        }
        self.set_cached_node(hash, enc);
        true
    }

    /// Staged bytes and preimage bytes.
    pub fn size(&self) -> Result<(u64, u64), DatabaseError> {
        let staging = self.read_staging()?;
        Ok((staging.nodes_size, staging.preimages_size))
    }

    /// Staged bytes including the flush-list bookkeeping.
    pub fn memory_footprint(&self) -> Result<u64, DatabaseError> {
        Ok(self.read_staging()?.memory_footprint())
    }

    /// Checks that every staged node is reachable from the sentinel. Very
    /// expensive, meant for debugging.
    pub fn verify_integrity(&self) -> Result<(), DatabaseError> {
        let unreachable = self.read_staging()?.unreachable();
        if unreachable.is_empty() {
            return Ok(());
        }
        Err(DatabaseError::Integrity(unreachable))
    }

    pub fn update_metric_nodes(&self) -> Result<(), DatabaseError> {
        let nodes = self.read_staging()?.nodes.len();
        self.metrics
            .nodes
            .set(i64::try_from(nodes).unwrap_or(i64::MAX));
        if let Some(stats) = self.cache.as_ref().and_then(|cache| cache.update_stats()) {
            self.metrics.record_cache_stats(&stats);
        }
        Ok(())
    }

    /// Walks the trie below `hash`, sending one [`NodeInfo`] per node with
    /// the depth set for leaves.
    pub fn collect_children_stats(
        &self,
        hash: H256,
        depth: usize,
        sender: &Sender<NodeInfo>,
    ) -> Result<(), DatabaseError> {
        let Some(node) = self.decoded_node(hash)? else {
            return Ok(());
        };
        let children = direct_child_hashes(&node);
        let info = NodeInfo {
            depth: if children.is_empty() { depth } else { 0 },
            finished: false,
        };
        if sender.send(info).is_err() {
            return Ok(());
        }
        for child in children {
            self.collect_children_stats(child, depth + 1, sender)?;
        }
        Ok(())
    }
}

fn direct_child_hashes(node: &Node) -> Vec<H256> {
    match node {
        Node::Short(short) => match short.val.as_ref() {
            Node::Hash(hash) => vec![*hash],
            _ => Vec::new(),
        },
        Node::Full(full) => full
            .children
            .iter()
            .filter_map(|child| match child {
                Some(Node::Hash(hash)) => Some(*hash),
                _ => None,
            })
            .collect(),
        Node::Hash(_) | Node::Value(_) => Vec::new(),
    }
}

impl NodeReader for NodeDatabase {
    fn node(&self, hash: H256) -> Result<Option<Vec<u8>>, TrieError> {
        if hash.is_zero() {
            return Ok(None);
        }
        NodeDatabase::node(self, hash).map_err(|err| TrieError::DbError(err.to_string()))
    }
}

impl NodeWriter for NodeDatabase {
    fn insert_node(&self, hash: H256, len_encoded: u16, node: Node) -> Result<(), TrieError> {
        self.staging
            .write()
            .map_err(|_| TrieError::LockError)?
            .insert(hash, len_encoded, StoredNode::Collapsed(node));
        Ok(())
    }
}
