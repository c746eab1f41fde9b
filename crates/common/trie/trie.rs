pub mod db;
pub mod error;
mod hasher;
pub mod nibbles;
mod node;
mod rlp;

use ethereum_types::H256;
use sha3::{Digest, Keccak256};
use std::sync::Arc;

pub use self::db::{InMemoryNodeStore, NodeReader, NodeWriter};
pub use self::error::TrieError;
pub use self::hasher::Hasher;
pub use self::nibbles::Nibbles;
pub use self::node::{FULL_NODE_SLOTS, FullNode, Node, ShortNode};
pub use self::rlp::MAX_EMBEDDED_SIZE;

use self::nibbles::{hex_to_keybytes, prefix_len};

use lazy_static::lazy_static;

/// Encoding of an empty RLP string, used for empty trie slots.
pub const RLP_NULL: u8 = 0x80;

lazy_static! {
    // Hash value for an empty trie, equal to keccak(RLP_NULL)
    pub static ref EMPTY_TRIE_HASH: H256 = keccak([RLP_NULL]);
}

pub fn keccak(data: impl AsRef<[u8]>) -> H256 {
    H256::from_slice(Keccak256::digest(data.as_ref()).as_slice())
}

/// RLP-encoded trie path
pub type PathRLP = Vec<u8>;
/// RLP-encoded trie value
pub type ValueRLP = Vec<u8>;

/// Ethereum compatible Merkle Patricia Trie backed by a [`NodeReader`].
///
/// Nodes are resolved lazily; inserts expand the touched paths in memory
/// until [`Trie::commit`] collapses them into a [`NodeWriter`].
pub struct Trie {
    root: Option<Node>,
    db: Arc<dyn NodeReader>,
}

impl Trie {
    /// Creates an empty trie over `db`
    pub fn new(db: Arc<dyn NodeReader>) -> Self {
        Self { root: None, db }
    }

    /// Creates an empty trie backed by a throwaway in-memory store
    pub fn new_temp() -> Self {
        Self::new(Arc::new(InMemoryNodeStore::new_empty()))
    }

    /// Creates a trie whose root node lives in `db`
    pub fn open(db: Arc<dyn NodeReader>, root: H256) -> Self {
        let root = (root != *EMPTY_TRIE_HASH && !root.is_zero()).then_some(Node::Hash(root));
        Self { root, db }
    }

    /// Retrieves the value stored under `path`
    pub fn get(&self, path: &[u8]) -> Result<Option<ValueRLP>, TrieError> {
        match &self.root {
            Some(root) => self.get_at(root, &Nibbles::from_bytes(path).into_vec()),
            None => Ok(None),
        }
    }

    /// Inserts `value` under `path`, replacing any previous value.
    pub fn insert(&mut self, path: PathRLP, value: ValueRLP) -> Result<(), TrieError> {
        let key = Nibbles::from_bytes(&path).into_vec();
        let root = self.root.take();
        self.root = Some(self.insert_at(root, &key, Node::Value(value))?);
        Ok(())
    }

    /// Computes the root hash without storing any node
    pub fn hash_no_commit(&self) -> Result<H256, TrieError> {
        match &self.root {
            Some(root) => Hasher::new().hash_root(root),
            None => Ok(*EMPTY_TRIE_HASH),
        }
    }

    /// Collapses the trie into `writer`, children before parents, and
    /// returns the root hash. The trie keeps only the root reference after.
    pub fn commit(&mut self, writer: &dyn NodeWriter) -> Result<H256, TrieError> {
        let Some(root) = &self.root else {
            return Ok(*EMPTY_TRIE_HASH);
        };
        let hash = Hasher::with_writer(writer).hash_root(root)?;
        self.root = Some(Node::Hash(hash));
        Ok(hash)
    }

    /// Returns every `(path, value)` pair in key order
    pub fn entries(&self) -> Result<Vec<(PathRLP, ValueRLP)>, TrieError> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            self.collect(root, &mut Vec::new(), &mut out)?;
        }
        Ok(out)
    }

    fn resolve(&self, hash: H256) -> Result<Node, TrieError> {
        let encoded = self.db.node(hash)?.ok_or(TrieError::MissingNode(hash))?;
        Node::decode(&encoded)
    }

    fn get_at(&self, node: &Node, key: &[u8]) -> Result<Option<ValueRLP>, TrieError> {
        match node {
            Node::Value(value) => Ok(key.is_empty().then(|| value.clone())),
            Node::Short(short) => {
                if key.starts_with(short.key.as_ref()) {
                    self.get_at(&short.val, &key[short.key.len()..])
                } else {
                    Ok(None)
                }
            }
            Node::Full(full) => match key.split_first() {
                Some((choice, rest)) => match &full.children[*choice as usize] {
                    Some(child) => self.get_at(child, rest),
                    None => Ok(None),
                },
                None => Ok(None),
            },
            Node::Hash(hash) => {
                let resolved = self.resolve(*hash)?;
                self.get_at(&resolved, key)
            }
        }
    }

    fn insert_at(&self, node: Option<Node>, key: &[u8], value: Node) -> Result<Node, TrieError> {
        if key.is_empty() {
            return Ok(value);
        }
        let Some(node) = node else {
            return Ok(ShortNode::new(Nibbles::from_hex(key.to_vec()), value).into());
        };
        match node {
            Node::Short(short) => {
                let matched = prefix_len(key, short.key.as_ref());
                if matched == short.key.len() {
                    let child = self.insert_at(Some(*short.val), &key[matched..], value)?;
                    return Ok(ShortNode::new(short.key, child).into());
                }
                // Split into a full node at the first differing nibble
                let existing = short.key.as_ref();
                let mut branch = FullNode::default();
                branch.children[existing[matched] as usize] =
                    Some(self.insert_at(None, &existing[matched + 1..], *short.val)?);
                branch.children[key[matched] as usize] =
                    Some(self.insert_at(None, &key[matched + 1..], value)?);
                if matched == 0 {
                    Ok(branch.into())
                } else {
                    let prefix = Nibbles::from_hex(key[..matched].to_vec());
                    Ok(ShortNode::new(prefix, branch.into()).into())
                }
            }
            Node::Full(mut full) => {
                let choice = key[0] as usize;
                let child = full.children[choice].take();
                full.children[choice] = Some(self.insert_at(child, &key[1..], value)?);
                Ok(Node::Full(full))
            }
            Node::Hash(hash) => {
                let resolved = self.resolve(hash)?;
                self.insert_at(Some(resolved), key, value)
            }
            Node::Value(_) => Err(TrieError::InvalidNode(
                "value node found before the end of the path".to_string(),
            )),
        }
    }

    fn collect(
        &self,
        node: &Node,
        path: &mut Vec<u8>,
        out: &mut Vec<(PathRLP, ValueRLP)>,
    ) -> Result<(), TrieError> {
        match node {
            Node::Value(value) => out.push((hex_to_keybytes(path), value.clone())),
            Node::Short(short) => {
                let len = path.len();
                path.extend_from_slice(short.key.as_ref());
                self.collect(&short.val, path, out)?;
                path.truncate(len);
            }
            Node::Full(full) => {
                for (choice, child) in full.children.iter().enumerate() {
                    if let Some(child) = child {
                        path.push(choice as u8);
                        self.collect(child, path, out)?;
                        path.pop();
                    }
                }
            }
            Node::Hash(hash) => {
                let resolved = self.resolve(*hash)?;
                self.collect(&resolved, path, out)?;
            }
        }
        Ok(())
    }
}
