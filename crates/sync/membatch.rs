use ethereum_types::H256;
use std::collections::HashMap;

/// Results whose subtrees are complete, waiting to be flushed to disk.
///
/// Trie nodes and raw entries live in separate maps since the same hash may
/// name both. `order` records commit order, which is a post-order over the
/// fetched trie.
#[derive(Debug, Default)]
pub struct SyncMemBatch {
    nodes: HashMap<H256, Vec<u8>>,
    raw: HashMap<H256, Vec<u8>>,
    order: Vec<(H256, bool)>,
}

impl SyncMemBatch {
    pub fn has_node(&self, hash: &H256) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn has_raw(&self, hash: &H256) -> bool {
        self.raw.contains_key(hash)
    }

    pub(crate) fn insert_node(&mut self, hash: H256, data: Vec<u8>) {
        if self.nodes.insert(hash, data).is_none() {
            self.order.push((hash, false));
        }
    }

    pub(crate) fn insert_raw(&mut self, hash: H256, data: Vec<u8>) {
        if self.raw.insert(hash, data).is_none() {
            self.order.push((hash, true));
        }
    }

    /// Entries in commit order. The flag is set for raw entries.
    pub fn iter(&self) -> impl Iterator<Item = (H256, bool, &[u8])> + '_ {
        self.order.iter().filter_map(|(hash, raw)| {
            let map = if *raw { &self.raw } else { &self.nodes };
            map.get(hash).map(|data| (*hash, *raw, data.as_slice()))
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn reset(&mut self) {
        self.nodes.clear();
        self.raw.clear();
        self.order.clear();
    }
}
