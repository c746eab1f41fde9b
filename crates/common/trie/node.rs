use ethereum_types::H256;

use crate::nibbles::Nibbles;

/// Number of slots in a full node: 16 nibble branches plus the value slot.
pub const FULL_NODE_SLOTS: usize = 17;

/// A Merkle-Patricia trie node.
///
/// Expanded nodes own their children; collapsed nodes hold `Hash`
/// references for every child whose encoding is at least 32 bytes and keep
/// smaller children embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Short(ShortNode),
    Full(Box<FullNode>),
    /// Reference to a node stored elsewhere.
    Hash(H256),
    /// Leaf payload.
    Value(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortNode {
    /// Hex nibbles; a terminator marks a leaf.
    pub key: Nibbles,
    pub val: Box<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FullNode {
    pub children: [Option<Node>; FULL_NODE_SLOTS],
}

impl ShortNode {
    pub fn new(key: Nibbles, val: Node) -> Self {
        Self {
            key,
            val: Box::new(val),
        }
    }
}

impl FullNode {
    pub fn value(&self) -> Option<&[u8]> {
        match &self.children[FULL_NODE_SLOTS - 1] {
            Some(Node::Value(v)) => Some(v),
            _ => None,
        }
    }
}

impl From<ShortNode> for Node {
    fn from(node: ShortNode) -> Self {
        Node::Short(node)
    }
}

impl From<FullNode> for Node {
    fn from(node: FullNode) -> Self {
        Node::Full(Box::new(node))
    }
}

impl From<H256> for Node {
    fn from(hash: H256) -> Self {
        Node::Hash(hash)
    }
}

impl Node {
    /// Invokes `f` on every hash reference reachable from this node without
    /// crossing into another stored node. Embedded children are traversed.
    pub fn for_each_child_hash(&self, f: &mut dyn FnMut(H256)) {
        match self {
            Node::Short(short) => short.val.for_each_child_hash_inner(f),
            Node::Full(full) => {
                for child in full.children.iter().flatten() {
                    child.for_each_child_hash_inner(f);
                }
            }
            Node::Hash(_) | Node::Value(_) => {}
        }
    }

    fn for_each_child_hash_inner(&self, f: &mut dyn FnMut(H256)) {
        match self {
            Node::Hash(hash) => f(*hash),
            other => other.for_each_child_hash(f),
        }
    }

    /// Hash references directly held by this node, in slot order.
    pub fn child_hashes(&self) -> Vec<H256> {
        let mut hashes = Vec::new();
        self.for_each_child_hash(&mut |hash| hashes.push(hash));
        hashes
    }

    /// Approximate in-memory footprint of the node structure.
    pub fn size(&self) -> usize {
        match self {
            Node::Short(short) => short.key.len() + short.val.size(),
            Node::Full(full) => full
                .children
                .iter()
                .map(|child| child.as_ref().map_or(1, |c| c.size()))
                .sum(),
            Node::Hash(_) => 32,
            Node::Value(v) => v.len(),
        }
    }
}
