use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use ethereum_types::H256;
use tracing::debug;
use triedb_storage::{CodeKey, KeyValueStore, WriteBatch};
use triedb_trie::{
    EMPTY_TRIE_HASH, Node, TrieError,
    nibbles::{has_term, hex_to_compact, hex_to_keybytes},
};

use crate::{SyncBloom, SyncError, SyncLru, SyncMemBatch, SyncMetrics, error::ProcessError};

/// Keccak256 of the empty byte string, the hash of an empty raw entry.
pub const EMPTY_CODE_HASH: H256 = H256([
    0xc5, 0xd2, 0x46, 0x01, 0x86, 0xf7, 0x23, 0x3c, 0x92, 0x7e, 0x7d, 0xb2, 0xdc, 0xc7, 0x03, 0xc0,
    0xe5, 0x00, 0xb6, 0x53, 0xca, 0x82, 0x27, 0x3b, 0x7b, 0xfa, 0xd8, 0x04, 0x5d, 0x85, 0xa4, 0x70,
]);

/// Upper bound of in-flight requests at a single depth. `missing` stops
/// handing out hashes once the shallowest queued depth is saturated.
pub const MAX_FETCHES_PER_DEPTH: usize = 16384;

/// Path of a trie node in compact form. A single element addresses a node
/// of a standalone trie; two elements address a node of a storage trie
/// below the account identified by the first element.
pub type SyncPath = Vec<Vec<u8>>;

/// Builds the [`SyncPath`] of a node from its hex nibble path.
pub fn new_sync_path(path: &[u8]) -> SyncPath {
    if path.len() < 64 {
        return vec![hex_to_compact(path)];
    }
    vec![hex_to_keybytes(&path[..64]), hex_to_compact(&path[64..])]
}

/// Content delivered for a previously requested hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub hash: H256,
    pub data: Vec<u8>,
}

/// A leaf reached while processing a trie node.
#[derive(Debug)]
pub struct LeafEntry<'a> {
    /// Key bytes of the leaf: one element, or two for a leaf nested below
    /// an account leaf.
    pub paths: &'a [Vec<u8>],
    /// Full nibble path, terminator excluded.
    pub hexpath: &'a [u8],
    pub value: &'a [u8],
    /// Hash of the node holding the leaf.
    pub parent: H256,
    pub depth: usize,
}

/// Additional retrievals a leaf depends on. They are attached to the node
/// holding the leaf, which is committed only after they complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafFollowUp {
    SubTrie(H256),
    RawEntry(H256),
}

pub type LeafCallback =
    Arc<dyn Fn(&LeafEntry<'_>) -> Result<Vec<LeafFollowUp>, SyncError> + Send + Sync>;

struct Request {
    /// Nibble path from the sync root
    path: Vec<u8>,
    hash: H256,
    data: Option<Vec<u8>>,
    raw: bool,
    /// Node requests waiting for this one
    parents: Vec<H256>,
    depth: usize,
    /// Children still outstanding
    deps: usize,
    callback: Option<LeafCallback>,
    in_flight: bool,
}

impl Request {
    fn new(
        hash: H256,
        path: Vec<u8>,
        depth: usize,
        raw: bool,
        callback: Option<LeafCallback>,
    ) -> Self {
        Self {
            path,
            hash,
            data: None,
            raw,
            parents: Vec::new(),
            depth,
            deps: 0,
            callback,
            in_flight: false,
        }
    }

    fn queue_key(&self) -> QueueKey {
        QueueKey {
            depth: self.depth,
            path: self.path.clone(),
            raw: self.raw,
            hash: self.hash,
        }
    }
}

/// Shallowest first, then lexicographic path order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    depth: usize,
    path: Vec<u8>,
    raw: bool,
    hash: H256,
}

/// Schedules the retrieval of a whole trie given its root hash.
///
/// The caller loops over [`missing`](TrieSync::missing), fetches the
/// returned hashes, feeds them back through [`process`](TrieSync::process)
/// and periodically flushes completed subtrees with
/// [`commit`](TrieSync::commit). A node reaches the mem-batch only after
/// every descendant did, so a hash present on disk always has its whole
/// subtree present too.
///
/// Not thread safe, the caller serialises access.
pub struct TrieSync {
    database: Arc<dyn KeyValueStore>,
    membatch: SyncMemBatch,
    node_reqs: HashMap<H256, Request>,
    raw_reqs: HashMap<H256, Request>,
    queue: BTreeSet<QueueKey>,
    fetches: HashMap<usize, usize>,
    retrieved_by_depth: HashMap<usize, u64>,
    committed_by_depth: HashMap<usize, u64>,
    bloom: Option<Arc<SyncBloom>>,
    lru: Option<Arc<SyncLru>>,
    metrics: SyncMetrics,
}

impl TrieSync {
    /// Creates a sync of the trie rooted at `root`, checking for existing
    /// nodes through `lru` when given, else through `bloom` and the store.
    pub fn new(
        root: H256,
        database: Arc<dyn KeyValueStore>,
        callback: Option<LeafCallback>,
        bloom: Option<Arc<SyncBloom>>,
        lru: Option<Arc<SyncLru>>,
    ) -> Result<Self, SyncError> {
        let mut sync = Self {
            database,
            membatch: SyncMemBatch::default(),
            node_reqs: HashMap::new(),
            raw_reqs: HashMap::new(),
            queue: BTreeSet::new(),
            fetches: HashMap::new(),
            retrieved_by_depth: HashMap::new(),
            committed_by_depth: HashMap::new(),
            bloom,
            lru,
            metrics: SyncMetrics::new()?,
        };
        sync.add_sub_trie(root, &[], 0, H256::zero(), callback)?;
        Ok(sync)
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Schedules the trie rooted at `root` for retrieval. A non-zero
    /// `parent` must be a pending node request; it is held back until the
    /// new subtree completes.
    pub fn add_sub_trie(
        &mut self,
        root: H256,
        path: &[u8],
        depth: usize,
        parent: H256,
        callback: Option<LeafCallback>,
    ) -> Result<(), SyncError> {
        if !self.needs_node(&root)? {
            return Ok(());
        }
        let mut req = Request::new(root, path.to_vec(), depth, false, callback);
        self.attach_parent(&mut req, parent)?;
        self.schedule(req);
        Ok(())
    }

    /// Schedules an opaque entry, stored verbatim under its code key.
    pub fn add_raw_entry(
        &mut self,
        hash: H256,
        path: &[u8],
        depth: usize,
        parent: H256,
    ) -> Result<(), SyncError> {
        if !self.needs_raw(&hash)? {
            return Ok(());
        }
        let mut req = Request::new(hash, path.to_vec(), depth, true, None);
        self.attach_parent(&mut req, parent)?;
        self.schedule(req);
        Ok(())
    }

    /// Hands out up to `max` unknown hashes, zero meaning no limit. Node
    /// hashes come first, followed by raw entries.
    pub fn missing(&mut self, max: usize) -> Vec<H256> {
        let (mut nodes, _, raw) = self.missing_with_paths(max);
        nodes.extend(raw);
        nodes
    }

    /// Like [`missing`](TrieSync::missing), split into node hashes with
    /// their paths and raw entry hashes.
    pub fn missing_with_paths(&mut self, max: usize) -> (Vec<H256>, Vec<SyncPath>, Vec<H256>) {
        let mut nodes = Vec::new();
        let mut paths = Vec::new();
        let mut raw = Vec::new();

        while let Some(depth) = self.queue.first().map(|key| key.depth) {
            if max > 0 && nodes.len() + raw.len() >= max {
                break;
            }
            if self.fetches.get(&depth).copied().unwrap_or_default() > MAX_FETCHES_PER_DEPTH {
                break;
            }
            let Some(key) = self.queue.pop_first() else {
                break;
            };
            *self.fetches.entry(depth).or_default() += 1;

            let reqset = if key.raw {
                &mut self.raw_reqs
            } else {
                &mut self.node_reqs
            };
            if let Some(req) = reqset.get_mut(&key.hash) {
                req.in_flight = true;
            }
            if key.raw {
                raw.push(key.hash);
            } else {
                nodes.push(key.hash);
                paths.push(new_sync_path(&key.path));
            }
        }
        (nodes, paths, raw)
    }

    /// Injects retrieved contents. Returns whether anything was staged for
    /// commit. On failure the error carries the index of the rejected
    /// result; results before it stay processed.
    pub fn process(&mut self, results: &[SyncResult]) -> Result<bool, ProcessError> {
        let before = self.membatch.len();
        for (index, result) in results.iter().enumerate() {
            if let Err(source) = self.process_result(result) {
                return Err(ProcessError {
                    index,
                    committed: self.membatch.len() > before,
                    source,
                });
            }
        }
        Ok(self.membatch.len() > before)
    }

    /// Moves the staged entries into `batch` in commit order and records
    /// them as stored. Returns the number of entries written. On failure
    /// the mem-batch is kept so the commit can be retried.
    pub fn commit(&mut self, batch: &mut dyn WriteBatch) -> Result<usize, SyncError> {
        let mut written = 0;
        for (hash, raw, data) in self.membatch.iter() {
            let result = if raw {
                batch.put(CodeKey::new(&hash).as_ref(), data)
            } else {
                batch.put(hash.as_bytes(), data)
            };
            if let Err(source) = result {
                return Err(SyncError::Commit { written, source });
            }
            if let Some(bloom) = &self.bloom {
                bloom.add(&hash);
            }
            if let Some(lru) = &self.lru {
                lru.add(hash);
            }
            written += 1;
        }
        self.membatch.reset();
        debug!(written, "Committed trie sync batch");
        Ok(written)
    }

    /// Requests not yet committed.
    pub fn pending(&self) -> usize {
        self.node_reqs.len() + self.raw_reqs.len()
    }

    pub fn retrieved_by_depth(&self, depth: usize) -> u64 {
        self.retrieved_by_depth.get(&depth).copied().unwrap_or_default()
    }

    pub fn committed_by_depth(&self, depth: usize) -> u64 {
        self.committed_by_depth.get(&depth).copied().unwrap_or_default()
    }

    /// Rough completion estimate, in percent. Only the shallow depths are
    /// considered since deeper levels are far from fully discovered.
    pub fn calc_progress_percentage(&self) -> f64 {
        let mut progress: f64 = 0.0;
        for depth in 0..20 {
            let (committed, retrieved) = (
                self.committed_by_depth(depth),
                self.retrieved_by_depth(depth),
            );
            if retrieved == 0 {
                break;
            }
            let by_depth = committed as f64 / retrieved as f64 * 100.0;
            if depth < 4 {
                progress = progress.max(by_depth);
            }
            debug!(depth, committed, retrieved, progress = by_depth, "Trie sync progress by depth");
        }
        debug!(progress, "Trie sync progress");
        progress
    }

    fn process_result(&mut self, result: &SyncResult) -> Result<(), SyncError> {
        let hash = result.hash;
        let node_pending = self.node_reqs.get(&hash).map(|req| req.data.is_none());
        let raw_pending = self.raw_reqs.get(&hash).map(|req| req.data.is_none());
        if node_pending.is_none() && raw_pending.is_none() {
            return Err(SyncError::NotRequested(hash));
        }

        let mut filled = false;
        if raw_pending == Some(true) {
            filled = true;
            self.fill(hash, true, result.data.clone());
            self.commit_request(hash, true);
        }
        if node_pending == Some(true) {
            let node =
                Node::decode(&result.data).map_err(|source| SyncError::Decode { hash, source })?;
            self.process_node(hash, &node, result.data.clone())?;
            filled = true;
        }
        if !filled {
            return Err(SyncError::AlreadyProcessed(hash));
        }
        Ok(())
    }

    /// Attaches `data` and takes the request out of the queue if it was
    /// delivered without being asked for.
    fn fill(&mut self, hash: H256, raw: bool, data: Vec<u8>) {
        let reqset = if raw {
            &mut self.raw_reqs
        } else {
            &mut self.node_reqs
        };
        let Some(req) = reqset.get_mut(&hash) else {
            return;
        };
        req.data = Some(data);
        if !req.in_flight {
            self.queue.remove(&req.queue_key());
        }
    }

    /// Expands an arrived node. Every fallible step runs before the request
    /// is touched, so a rejected result can be delivered again.
    fn process_node(&mut self, hash: H256, node: &Node, data: Vec<u8>) -> Result<(), SyncError> {
        let Some((path, depth, callback)) = self
            .node_reqs
            .get(&hash)
            .map(|req| (req.path.clone(), req.depth, req.callback.clone()))
        else {
            return Ok(());
        };
        let requests = self.children(hash, &path, depth, callback.as_ref(), node)?;

        self.fill(hash, false, data);
        let Some(req) = self.node_reqs.get_mut(&hash) else {
            return Ok(());
        };
        if requests.is_empty() && req.deps == 0 {
            self.commit_request(hash, false);
            return Ok(());
        }
        req.deps += requests.len();
        for child in requests {
            self.schedule(child);
        }
        Ok(())
    }

    /// Builds the requests `node` depends on: its unknown hash children and
    /// the follow-ups the leaf callback returns for its values. Nothing is
    /// scheduled here.
    fn children(
        &self,
        hash: H256,
        path: &[u8],
        depth: usize,
        callback: Option<&LeafCallback>,
        node: &Node,
    ) -> Result<Vec<Request>, SyncError> {
        let mut found = Vec::new();
        collect_children(node, path, depth, &mut found);
        if found.is_empty() && !matches!(node, Node::Short(_) | Node::Full(_)) {
            return Err(SyncError::Decode {
                hash,
                source: TrieError::InvalidNode("expected short or full node".to_string()),
            });
        }

        let mut requests = Vec::new();
        for (child_path, child, child_depth) in found {
            match child {
                Node::Value(value) => {
                    let Some(callback) = callback else {
                        continue;
                    };
                    let paths = leaf_paths(&child_path);
                    let entry = LeafEntry {
                        paths: &paths,
                        hexpath: &child_path,
                        value,
                        parent: hash,
                        depth: child_depth,
                    };
                    for follow_up in callback(&entry)? {
                        let (target, raw) = match follow_up {
                            LeafFollowUp::SubTrie(root) => (root, false),
                            LeafFollowUp::RawEntry(raw) => (raw, true),
                        };
                        let needed = if raw {
                            self.needs_raw(&target)?
                        } else {
                            self.needs_node(&target)?
                        };
                        if needed {
                            let mut req =
                                Request::new(target, child_path.clone(), child_depth, raw, None);
                            req.parents.push(hash);
                            requests.push(req);
                        }
                    }
                }
                Node::Hash(child_hash) => {
                    if self.membatch.has_node(child_hash)
                        || self.is_stored(child_hash, child_hash.as_bytes())?
                    {
                        continue;
                    }
                    let mut req = Request::new(
                        *child_hash,
                        child_path,
                        child_depth,
                        false,
                        callback.cloned(),
                    );
                    req.parents.push(hash);
                    requests.push(req);
                }
                Node::Short(_) | Node::Full(_) => {}
            }
        }
        Ok(requests)
    }

    /// Whether the trie rooted at `root` still has to be fetched.
    fn needs_node(&self, root: &H256) -> Result<bool, SyncError> {
        if *root == *EMPTY_TRIE_HASH || self.membatch.has_node(root) {
            return Ok(false);
        }
        if self.is_stored(root, root.as_bytes())? {
            debug!(hash = %root, "Skipping sub trie already stored");
            return Ok(false);
        }
        Ok(true)
    }

    /// Whether the raw entry `hash` still has to be fetched.
    fn needs_raw(&self, hash: &H256) -> Result<bool, SyncError> {
        if *hash == EMPTY_CODE_HASH || self.membatch.has_raw(hash) {
            return Ok(false);
        }
        if self.is_stored(hash, CodeKey::new(hash).as_ref())? {
            debug!(%hash, "Skipping raw entry already stored");
            return Ok(false);
        }
        Ok(true)
    }

    /// Membership check, in order: exact LRU, else bloom then store.
    fn is_stored(&self, hash: &H256, key: &[u8]) -> Result<bool, SyncError> {
        if let Some(lru) = &self.lru {
            return Ok(lru.contains(hash));
        }
        if self.bloom.as_ref().is_some_and(|bloom| !bloom.contains(hash)) {
            return Ok(false);
        }
        if self.database.has(key)? {
            return Ok(true);
        }
        if self.bloom.is_some() {
            self.metrics.bloom_faults.inc();
        }
        Ok(false)
    }

    fn attach_parent(&mut self, req: &mut Request, parent: H256) -> Result<(), SyncError> {
        if parent.is_zero() {
            return Ok(());
        }
        let ancestor = self
            .node_reqs
            .get_mut(&parent)
            .ok_or(SyncError::UnknownParent(parent))?;
        ancestor.deps += 1;
        req.parents.push(parent);
        Ok(())
    }

    /// Queues `req`, or merges its parents into an identical pending request.
    fn schedule(&mut self, req: Request) {
        let reqset = if req.raw {
            &mut self.raw_reqs
        } else {
            &mut self.node_reqs
        };
        if let Some(old) = reqset.get_mut(&req.hash) {
            old.parents.extend(req.parents);
            return;
        }
        *self.retrieved_by_depth.entry(req.depth).or_default() += 1;
        self.metrics.retrieved.inc();
        self.queue.insert(req.queue_key());
        reqset.insert(req.hash, req);
    }

    /// Stages a completed request and releases parents left without
    /// outstanding children, transitively.
    fn commit_request(&mut self, hash: H256, raw: bool) {
        let mut stack = vec![(hash, raw)];
        while let Some((hash, raw)) = stack.pop() {
            let reqset = if raw {
                &mut self.raw_reqs
            } else {
                &mut self.node_reqs
            };
            let Some(req) = reqset.remove(&hash) else {
                continue;
            };
            *self.committed_by_depth.entry(req.depth).or_default() += 1;
            self.metrics.committed.inc();
            if req.in_flight {
                if let Some(fetches) = self.fetches.get_mut(&req.depth) {
                    *fetches = fetches.saturating_sub(1);
                }
            }

            let data = req.data.unwrap_or_default();
            if raw {
                self.membatch.insert_raw(hash, data);
            } else {
                self.membatch.insert_node(hash, data);
            }

            for parent in req.parents {
                let Some(ancestor) = self.node_reqs.get_mut(&parent) else {
                    continue;
                };
                ancestor.deps = ancestor.deps.saturating_sub(1);
                if ancestor.deps == 0 && ancestor.data.is_some() {
                    stack.push((parent, false));
                }
            }
        }
    }
}

/// Collects the value and hash children of `node` with their paths and
/// depths. Embedded nodes are descended into.
fn collect_children<'a>(
    node: &'a Node,
    path: &[u8],
    depth: usize,
    out: &mut Vec<(Vec<u8>, &'a Node, usize)>,
) {
    let mut push = |child: &'a Node, child_path: Vec<u8>, child_depth: usize| match child {
        Node::Short(_) | Node::Full(_) => collect_children(child, &child_path, child_depth, out),
        _ => out.push((child_path, child, child_depth)),
    };
    match node {
        Node::Short(short) => {
            let key = short.key.as_ref();
            let stripped = if has_term(key) {
                &key[..key.len() - 1]
            } else {
                key
            };
            push(short.val.as_ref(), [path, stripped].concat(), depth + key.len());
        }
        Node::Full(full) => {
            for (i, child) in full.children.iter().enumerate() {
                if let Some(child) = child {
                    push(child, [path, &[i as u8][..]].concat(), depth + 1);
                }
            }
        }
        Node::Hash(_) | Node::Value(_) => {}
    }
}

/// Key bytes of a leaf. Paths longer than one hashed key are split after
/// the first 32 bytes.
fn leaf_paths(hexpath: &[u8]) -> Vec<Vec<u8>> {
    if hexpath.len() == 128 {
        return vec![
            hex_to_keybytes(&hexpath[..64]),
            hex_to_keybytes(&hexpath[64..]),
        ];
    }
    vec![hex_to_keybytes(hexpath)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::{
        collections::BTreeMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use triedb_storage::{InMemoryStore, StoreNodeReader};
    use triedb_trie::{InMemoryNodeStore, NodeReader, Trie, keccak};

    type Entries = BTreeMap<Vec<u8>, Vec<u8>>;

    fn source_trie(entries: usize, seed: u64) -> (InMemoryNodeStore, H256, Entries) {
        let mut rng = StdRng::seed_from_u64(seed);
        let source = InMemoryNodeStore::new_empty();
        let mut trie = Trie::new(Arc::new(source.clone()));
        let mut kv = Entries::new();
        for _ in 0..entries {
            let key: [u8; 32] = rng.r#gen();
            let value: [u8; 20] = rng.r#gen();
            trie.insert(key.to_vec(), value.to_vec()).unwrap();
            kv.insert(key.to_vec(), value.to_vec());
        }
        let root = trie.commit(&source).unwrap();
        (source, root, kv)
    }

    fn serve(source: &InMemoryNodeStore, hashes: &[H256]) -> Vec<SyncResult> {
        hashes
            .iter()
            .map(|hash| SyncResult {
                hash: *hash,
                data: source.node(*hash).unwrap().unwrap(),
            })
            .collect()
    }

    fn flush(sync: &mut TrieSync, dest: &InMemoryStore) -> usize {
        let mut batch = dest.new_batch();
        let written = sync.commit(batch.as_mut()).unwrap();
        batch.write().unwrap();
        written
    }

    fn drive(sync: &mut TrieSync, source: &InMemoryNodeStore, dest: &InMemoryStore) {
        loop {
            let hashes = sync.missing(100);
            if hashes.is_empty() {
                break;
            }
            sync.process(&serve(source, &hashes)).unwrap();
            flush(sync, dest);
        }
        assert_eq!(sync.pending(), 0);
    }

    fn read_back(dest: &InMemoryStore, root: H256) -> Entries {
        let reader = StoreNodeReader::new(Arc::new(dest.clone()));
        Trie::open(Arc::new(reader), root)
            .entries()
            .unwrap()
            .into_iter()
            .collect()
    }

    fn new_sync(root: H256, dest: &InMemoryStore) -> TrieSync {
        TrieSync::new(root, Arc::new(dest.clone()), None, None, None).unwrap()
    }

    #[test]
    fn sync_path_splits_account_and_storage() {
        assert_eq!(new_sync_path(&[]), vec![vec![0x00]]);
        assert_eq!(new_sync_path(&[1, 2, 3]), vec![vec![0x11, 0x23]]);

        let mut path = vec![0xa; 64];
        path.extend([0x1, 0x2]);
        assert_eq!(
            new_sync_path(&path),
            vec![vec![0xaa; 32], vec![0x00, 0x12]]
        );
    }

    #[test]
    fn empty_root_needs_nothing() {
        let dest = InMemoryStore::open();
        let mut sync = new_sync(*EMPTY_TRIE_HASH, &dest);
        assert_eq!(sync.pending(), 0);
        assert!(sync.missing(0).is_empty());
    }

    #[test]
    fn syncs_whole_trie() {
        let (source, root, entries) = source_trie(300, 1);
        let dest = InMemoryStore::open();
        let mut sync = new_sync(root, &dest);
        assert_eq!(sync.missing(0), vec![root]);
        // root is in flight, asking again hands out nothing new
        assert!(sync.missing(0).is_empty());

        sync.process(&serve(&source, &[root])).unwrap();
        flush(&mut sync, &dest);
        drive(&mut sync, &source, &dest);

        assert_eq!(read_back(&dest, root), entries);
        assert_eq!(dest.len().unwrap(), source.len());
        assert_eq!(sync.calc_progress_percentage(), 100.0);
    }

    #[test]
    fn stored_root_is_not_requested() {
        let (source, root, _) = source_trie(50, 2);
        let dest = InMemoryStore::open();
        let mut sync = new_sync(root, &dest);
        drive(&mut sync, &source, &dest);

        let sync = new_sync(root, &dest);
        assert_eq!(sync.pending(), 0);
    }

    #[test]
    fn rejects_unrequested_and_repeated_results() {
        let (source, root, _) = source_trie(50, 3);
        let dest = InMemoryStore::open();
        let mut sync = new_sync(root, &dest);

        let stranger = SyncResult {
            hash: H256::repeat_byte(0x42),
            data: vec![0xc0],
        };
        let err = sync.process(&[stranger]).unwrap_err();
        assert_eq!(err.index, 0);
        assert!(!err.committed);
        assert!(matches!(err.source, SyncError::NotRequested(_)));

        let results = serve(&source, &sync.missing(0));
        sync.process(&results).unwrap();
        let err = sync.process(&results).unwrap_err();
        assert!(matches!(err.source, SyncError::AlreadyProcessed(hash) if hash == root));
    }

    #[test]
    fn tampered_node_is_rejected_and_retried() {
        let (source, root, entries) = source_trie(200, 4);
        let dest = InMemoryStore::open();
        let mut sync = new_sync(root, &dest);
        let results = serve(&source, &sync.missing(0));
        sync.process(&results).unwrap();

        let hashes = sync.missing(0);
        assert!(hashes.len() > 3);
        let mut results = serve(&source, &hashes);
        let original = results[2].clone();
        results[2].data[0] ^= 0xff;

        let err = sync.process(&results).unwrap_err();
        assert_eq!(err.index, 2);
        assert!(matches!(err.source, SyncError::Decode { hash, .. } if hash == hashes[2]));
        // the first two were accepted, re-sending them is refused
        assert!(matches!(
            sync.process(&results[..1]).unwrap_err().source,
            SyncError::AlreadyProcessed(_)
        ));

        results[2] = original;
        sync.process(&results[2..]).unwrap();
        drive(&mut sync, &source, &dest);
        assert_eq!(read_back(&dest, root), entries);
    }

    #[test]
    fn commit_order_is_post_order() {
        let (source, root, _) = source_trie(500, 5);
        let dest = InMemoryStore::open();
        let mut sync = new_sync(root, &dest);
        loop {
            let hashes = sync.missing(0);
            if hashes.is_empty() {
                break;
            }
            sync.process(&serve(&source, &hashes)).unwrap();
        }

        let order: Vec<H256> = sync.membatch.iter().map(|(hash, _, _)| hash).collect();
        assert_eq!(order.len(), source.len());
        assert_eq!(order.last(), Some(&root));
        let position: HashMap<H256, usize> =
            order.iter().enumerate().map(|(i, hash)| (*hash, i)).collect();
        for (hash, _, data) in sync.membatch.iter() {
            for child in Node::decode(data).unwrap().child_hashes() {
                assert!(position[&child] < position[&hash]);
            }
        }
    }

    #[test]
    fn delivering_queued_requests_unasked_is_accepted() {
        let (source, root, entries) = source_trie(100, 6);
        let dest = InMemoryStore::open();
        let mut sync = new_sync(root, &dest);
        // root handed over before anyone asked for it
        sync.process(&serve(&source, &[root])).unwrap();
        assert!(!sync.missing(0).contains(&root));
        drive(&mut sync, &source, &dest);
        assert_eq!(read_back(&dest, root), entries);
    }

    #[test]
    fn leaf_callback_schedules_raw_entries() {
        let mut codes = HashMap::new();
        let source = InMemoryNodeStore::new_empty();
        let mut trie = Trie::new(Arc::new(source.clone()));
        for i in 0..8u8 {
            let code = vec![i; 40];
            let hash = keccak(&code);
            trie.insert(keccak([i]).as_bytes().to_vec(), hash.as_bytes().to_vec())
                .unwrap();
            codes.insert(hash, code);
        }
        let root = trie.commit(&source).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let callback: LeafCallback = Arc::new(move |leaf: &LeafEntry<'_>| {
            assert_eq!(leaf.paths.len(), 1);
            assert_eq!(leaf.hexpath.len(), 64);
            recorder.lock().unwrap().push(leaf.paths[0].clone());
            Ok(vec![LeafFollowUp::RawEntry(H256::from_slice(leaf.value))])
        });
        let dest = InMemoryStore::open();
        let mut sync =
            TrieSync::new(root, Arc::new(dest.clone()), Some(callback), None, None).unwrap();

        loop {
            let (nodes, _, raw) = sync.missing_with_paths(0);
            if nodes.is_empty() && raw.is_empty() {
                break;
            }
            let mut results = serve(&source, &nodes);
            results.extend(raw.iter().map(|hash| SyncResult {
                hash: *hash,
                data: codes[hash].clone(),
            }));
            sync.process(&results).unwrap();
        }
        assert_eq!(sync.pending(), 0);
        assert_eq!(seen.lock().unwrap().len(), 8);

        // every leaf node is staged after the code it references
        let order: Vec<(H256, bool)> = sync
            .membatch
            .iter()
            .map(|(hash, raw, _)| (hash, raw))
            .collect();
        for code_hash in codes.keys() {
            let code_at = order.iter().position(|e| *e == (*code_hash, true)).unwrap();
            let root_at = order.iter().position(|e| *e == (root, false)).unwrap();
            assert!(code_at < root_at);
        }

        assert_eq!(flush(&mut sync, &dest), source.len() + codes.len());
        for (hash, code) in &codes {
            assert_eq!(dest.get(CodeKey::new(hash).as_ref()).unwrap().as_ref(), Some(code));
        }
    }

    #[test]
    fn callback_error_aborts_processing() {
        let (source, root, _) = source_trie(3, 7);
        let callback: LeafCallback =
            Arc::new(|_: &LeafEntry<'_>| Err(SyncError::Callback("refused".to_string())));
        let dest = InMemoryStore::open();
        let mut sync =
            TrieSync::new(root, Arc::new(dest.clone()), Some(callback), None, None).unwrap();
        let mut failed = false;
        for _ in 0..4 {
            let hashes = sync.missing(0);
            if let Err(err) = sync.process(&serve(&source, &hashes)) {
                assert!(matches!(err.source, SyncError::Callback(_)));
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn rejected_result_can_be_delivered_again() {
        let (source, root, entries) = source_trie(200, 8);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback: LeafCallback = Arc::new(move |_: &LeafEntry<'_>| {
            if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                return Err(SyncError::Callback("transient".to_string()));
            }
            Ok(Vec::new())
        });
        let dest = InMemoryStore::open();
        let mut sync =
            TrieSync::new(root, Arc::new(dest.clone()), Some(callback), None, None).unwrap();

        let mut rejected = 0;
        loop {
            let hashes = sync.missing(0);
            if hashes.is_empty() {
                break;
            }
            let mut results = serve(&source, &hashes);
            while let Err(err) = sync.process(&results) {
                assert!(matches!(err.source, SyncError::Callback(_)));
                rejected += 1;
                results.drain(..err.index);
            }
            flush(&mut sync, &dest);
        }

        assert_eq!(rejected, 1);
        assert_eq!(sync.pending(), 0);
        assert_eq!(read_back(&dest, root), entries);
    }

    #[test]
    fn sub_trie_parent_must_be_pending() {
        let dest = InMemoryStore::open();
        let mut sync = new_sync(H256::repeat_byte(1), &dest);
        let err = sync
            .add_sub_trie(H256::repeat_byte(2), &[], 0, H256::repeat_byte(3), None)
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownParent(_)));
        sync.add_sub_trie(H256::repeat_byte(2), &[], 1, H256::repeat_byte(1), None)
            .unwrap();
        assert_eq!(sync.pending(), 2);
    }

    #[test]
    fn empty_code_is_never_requested() {
        let dest = InMemoryStore::open();
        let mut sync = new_sync(*EMPTY_TRIE_HASH, &dest);
        assert_eq!(EMPTY_CODE_HASH, keccak([]));
        sync.add_raw_entry(EMPTY_CODE_HASH, &[], 0, H256::zero()).unwrap();
        assert_eq!(sync.pending(), 0);
    }

    #[test]
    fn bloom_false_positive_is_counted() {
        let (source, root, entries) = source_trie(100, 8);
        let dest = InMemoryStore::open();
        let bloom = Arc::new(SyncBloom::new(1));
        bloom.add(&root);
        let mut sync =
            TrieSync::new(root, Arc::new(dest.clone()), None, Some(bloom.clone()), None).unwrap();
        assert_eq!(sync.metrics().bloom_faults.get(), 1);
        assert_eq!(sync.pending(), 1);

        drive(&mut sync, &source, &dest);
        assert_eq!(read_back(&dest, root), entries);
        for key in dest.keys().unwrap() {
            assert!(bloom.contains(&H256::from_slice(&key)));
        }
    }

    #[test]
    fn lru_bypasses_store_lookups() {
        let dest = InMemoryStore::open();
        let lru = Arc::new(SyncLru::new(16));
        let known = H256::repeat_byte(9);
        lru.add(known);
        let sync = TrieSync::new(known, Arc::new(dest.clone()), None, None, Some(lru.clone()))
            .unwrap();
        assert_eq!(sync.pending(), 0);

        // stored but unknown to the lru: fetched again
        let (source, root, _) = source_trie(20, 9);
        let mut sync = new_sync(root, &dest);
        drive(&mut sync, &source, &dest);
        let reads = dest.metrics().snapshot().reads;
        let sync = TrieSync::new(root, Arc::new(dest.clone()), None, None, Some(lru)).unwrap();
        assert_eq!(sync.pending(), 1);
        assert_eq!(dest.metrics().snapshot().reads, reads);
    }

    #[test]
    fn fetches_are_throttled_per_depth() {
        let dest = InMemoryStore::open();
        let mut sync = new_sync(H256::repeat_byte(1), &dest);
        for i in 0..(MAX_FETCHES_PER_DEPTH as u64 + 10) {
            let hash = keccak(i.to_be_bytes());
            sync.add_sub_trie(hash, &[], 0, H256::zero(), None).unwrap();
        }
        assert_eq!(sync.missing(0).len(), MAX_FETCHES_PER_DEPTH + 1);
        assert!(sync.missing(0).is_empty());
        assert_eq!(sync.missing(5).len(), 0);
    }

    #[test]
    fn progress_tracks_shallow_depths() {
        let (source, root, _) = source_trie(1000, 10);
        let dest = InMemoryStore::open();
        let mut sync = new_sync(root, &dest);
        assert_eq!(sync.calc_progress_percentage(), 0.0);

        let hashes = sync.missing(0);
        sync.process(&serve(&source, &hashes)).unwrap();
        let children = sync.missing(0);
        assert_eq!(sync.retrieved_by_depth(0), 1);
        assert_eq!(sync.retrieved_by_depth(1), 16);

        let (first, rest) = children.split_at(children.len() / 2);
        sync.process(&serve(&source, first)).unwrap();
        assert_eq!(sync.committed_by_depth(0), 0);
        assert_eq!(sync.calc_progress_percentage(), 0.0);

        sync.process(&serve(&source, rest)).unwrap();
        drive(&mut sync, &source, &dest);
        assert_eq!(sync.committed_by_depth(0), 1);
        assert_eq!(sync.committed_by_depth(1), 16);
        assert_eq!(sync.calc_progress_percentage(), 100.0);
    }
}
