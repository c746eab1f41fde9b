//! In-memory working set of the node database.
//!
//! Staged nodes form a reference-counted graph anchored at the zero-hash
//! sentinel, and a doubly linked flush-list ordering them by insertion. Both
//! links of the list are node hashes, keys into the same map.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use ethereum_types::H256;
use tracing::{debug, error};
use triedb_trie::Node;

pub(crate) const HASH_LENGTH: u64 = 32;

/// Content of a staged entry.
#[derive(Debug, Clone)]
pub(crate) enum StoredNode {
    /// Collapsed trie node, re-encoded on demand.
    Collapsed(Node),
    /// Pre-encoded payload, never decoded nor traversed.
    Raw(Vec<u8>),
}

#[derive(Debug, Default)]
pub(crate) struct CachedNode {
    /// `None` only for the sentinel
    pub node: Option<StoredNode>,
    pub size: u16,
    pub parents: u64,
    /// Explicit references to other staged nodes, with multiplicity
    pub children: Option<HashMap<H256, u64>>,
    pub flush_prev: H256,
    pub flush_next: H256,
}

impl CachedNode {
    pub fn rlp(&self) -> Vec<u8> {
        match &self.node {
            Some(StoredNode::Collapsed(node)) => node.encode_to_vec(),
            Some(StoredNode::Raw(blob)) => blob.clone(),
            None => Vec::new(),
        }
    }

    /// Tracked children: the explicit ones first, then the hash references
    /// held inside the node itself.
    pub fn childs(&self) -> Vec<H256> {
        let mut children: Vec<H256> = self
            .children
            .as_ref()
            .map(|children| children.keys().copied().collect())
            .unwrap_or_default();
        if let Some(StoredNode::Collapsed(node)) = &self.node {
            node.for_each_child_hash(&mut |hash| children.push(hash));
        }
        children
    }
}

#[derive(Debug)]
pub(crate) struct Staging {
    pub nodes: HashMap<H256, CachedNode>,
    pub oldest: H256,
    pub newest: H256,
    /// Staged bytes, `HASH_LENGTH + size` per node
    pub nodes_size: u64,

    pub preimages: HashMap<H256, Vec<u8>>,
    pub preimages_size: u64,

    pub gc_nodes: u64,
    pub gc_size: u64,
    pub gc_time: Duration,
    pub flush_nodes: u64,
    pub flush_size: u64,
    pub flush_time: Duration,
}

impl Default for Staging {
    fn default() -> Self {
        Self {
            nodes: HashMap::from([(H256::zero(), CachedNode::default())]),
            oldest: H256::zero(),
            newest: H256::zero(),
            nodes_size: 0,
            preimages: HashMap::new(),
            preimages_size: 0,
            gc_nodes: 0,
            gc_size: 0,
            gc_time: Duration::ZERO,
            flush_nodes: 0,
            flush_size: 0,
            flush_time: Duration::ZERO,
        }
    }
}

impl Staging {
    /// Bytes used by staged nodes plus the two flush-list links each of them
    /// carries.
    pub fn memory_footprint(&self) -> u64 {
        let tracked = self.nodes.len().saturating_sub(1) as u64;
        self.nodes_size + tracked * 2 * HASH_LENGTH
    }

    pub fn insert(&mut self, hash: H256, size: u16, node: StoredNode) {
        if self.nodes.contains_key(&hash) {
            return;
        }
        let mut entry = CachedNode {
            node: Some(node),
            size,
            ..Default::default()
        };
        for child in entry.childs() {
            if let Some(child) = self.nodes.get_mut(&child) {
                child.parents += 1;
            }
        }

        if self.oldest.is_zero() {
            self.oldest = hash;
            self.newest = hash;
        } else {
            if !self.nodes.contains_key(&self.newest) {
                let missing_newest = self.newest;
                self.newest = self.last_node_in_flush_list();
                if let Some(newest) = self.nodes.get_mut(&self.newest) {
                    newest.flush_next = H256::zero();
                }
                error!(old_newest = ?missing_newest, new_newest = ?self.newest, "Found a newest node for missing newest");
            }
            entry.flush_prev = self.newest;
            if let Some(newest) = self.nodes.get_mut(&self.newest) {
                newest.flush_next = hash;
            }
            self.newest = hash;
        }
        self.nodes.insert(hash, entry);
        self.nodes_size += HASH_LENGTH + u64::from(size);
    }

    pub fn insert_preimage(&mut self, hash: H256, preimage: &[u8]) {
        if self.preimages.contains_key(&hash) {
            return;
        }
        self.preimages.insert(hash, preimage.to_vec());
        self.preimages_size += HASH_LENGTH + preimage.len() as u64;
    }

    pub fn clear_preimages(&mut self) {
        self.preimages.clear();
        self.preimages_size = 0;
    }

    /// Adds an edge `parent -> child`. Edges from regular nodes are counted
    /// once; edges from the sentinel count every call.
    pub fn reference(&mut self, child: H256, parent: H256) {
        if !self.nodes.contains_key(&child) {
            return;
        }
        let Some(parent_node) = self.nodes.get_mut(&parent) else {
            return;
        };
        let children = parent_node.children.get_or_insert_with(HashMap::new);
        if children.contains_key(&child) && !parent.is_zero() {
            return;
        }
        *children.entry(child).or_default() += 1;
        if let Some(child) = self.nodes.get_mut(&child) {
            child.parents += 1;
        }
    }

    /// Drops the edge `parent -> child`, releasing `child` and cascading into
    /// its subtree once nothing references it anymore.
    pub fn dereference(&mut self, child: H256, parent: H256) {
        if let Some(children) = self
            .nodes
            .get_mut(&parent)
            .and_then(|parent| parent.children.as_mut())
        {
            if let Some(count) = children.get_mut(&child) {
                *count -= 1;
                if *count == 0 {
                    children.remove(&child);
                }
            }
        }
        let Some(node) = self.nodes.get_mut(&child) else {
            return;
        };
        // A node re-staged after being flushed may have no parents left
        node.parents = node.parents.saturating_sub(1);
        if node.parents > 0 {
            return;
        }
        let grandchildren = node.childs();
        self.remove_from_flush_list(child);
        for grandchild in grandchildren {
            self.dereference(grandchild, child);
        }
        if let Some(node) = self.nodes.remove(&child) {
            self.nodes_size -= HASH_LENGTH + u64::from(node.size);
        }
    }

    /// Removes the subtree rooted at `hash` after it was persisted.
    pub fn uncache(&mut self, hash: H256) {
        let Some(node) = self.nodes.get(&hash) else {
            return;
        };
        let children = node.childs();
        self.remove_from_flush_list(hash);
        for child in children {
            self.uncache(child);
        }
        if let Some(node) = self.nodes.remove(&hash) {
            self.nodes_size -= HASH_LENGTH + u64::from(node.size);
        }
    }

    /// Drops flushed entries from the head of the flush-list up to and
    /// including `last`. A zero `last` means nothing was flushed. Entries
    /// appended after `last` stay staged.
    pub fn prune_flushed(&mut self, last: H256) {
        if last.is_zero() {
            return;
        }
        while !self.oldest.is_zero() {
            let Some(node) = self.nodes.remove(&self.oldest) else {
                break;
            };
            let pruned = self.oldest;
            self.oldest = node.flush_next;
            self.nodes_size -= HASH_LENGTH + u64::from(node.size);
            if pruned == last {
                break;
            }
        }
        match self.nodes.get_mut(&self.oldest) {
            Some(oldest) if !self.oldest.is_zero() => oldest.flush_prev = H256::zero(),
            _ => {
                self.oldest = H256::zero();
                self.newest = H256::zero();
            }
        }
    }

    pub fn remove_from_flush_list(&mut self, hash: H256) {
        let Some(node) = self.nodes.get(&hash) else {
            return;
        };
        let (prev, next) = (node.flush_prev, node.flush_next);
        if hash == self.oldest && hash == self.newest {
            self.oldest = H256::zero();
            self.newest = H256::zero();
        } else if hash == self.oldest {
            self.oldest = next;
            if let Some(next) = self.nodes.get_mut(&next) {
                next.flush_prev = H256::zero();
            }
        } else if hash == self.newest {
            self.newest = prev;
            if let Some(prev) = self.nodes.get_mut(&prev) {
                prev.flush_next = H256::zero();
            }
        } else {
            if let Some(prev) = self.nodes.get_mut(&prev) {
                prev.flush_next = next;
            }
            if let Some(next) = self.nodes.get_mut(&next) {
                next.flush_prev = prev;
            }
        }
    }

    /// Walks the flush-list from `oldest` to the last entry still present.
    pub fn last_node_in_flush_list(&self) -> H256 {
        let mut last = H256::zero();
        let mut current = self.oldest;
        while let Some(node) = self.nodes.get(&current) {
            last = current;
            if node.flush_next.is_zero() {
                debug!("Found last node in flush list");
                break;
            }
            current = node.flush_next;
        }
        last
    }

    /// Staged hashes in flush order, oldest first.
    pub fn flush_order(&self) -> Vec<H256> {
        let mut order = Vec::new();
        let mut current = self.oldest;
        while !current.is_zero() {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            order.push(current);
            current = node.flush_next;
        }
        order
    }

    /// Staged nodes that cannot be reached from the sentinel.
    pub fn unreachable(&self) -> Vec<H256> {
        let mut reachable = HashSet::from([H256::zero()]);
        let mut stack: Vec<H256> = self
            .nodes
            .get(&H256::zero())
            .map(CachedNode::childs)
            .unwrap_or_default();
        while let Some(hash) = stack.pop() {
            let Some(node) = self.nodes.get(&hash) else {
                continue;
            };
            if reachable.insert(hash) {
                stack.extend(node.childs());
            }
        }
        self.nodes
            .keys()
            .filter(|hash| !reachable.contains(*hash))
            .copied()
            .collect()
    }

    pub fn reset_stats(&mut self) {
        self.gc_nodes = 0;
        self.gc_size = 0;
        self.gc_time = Duration::ZERO;
        self.flush_nodes = 0;
        self.flush_size = 0;
        self.flush_time = Duration::ZERO;
    }
}
