use ethereum_types::H256;

use crate::{
    db::NodeWriter,
    error::TrieError,
    keccak,
    node::{FullNode, Node, ShortNode},
    rlp::MAX_EMBEDDED_SIZE,
};

/// Collapses an expanded trie bottom-up.
///
/// Children whose encoding is shorter than 32 bytes stay embedded in their
/// parent; every other node is replaced by its keccak hash and, when a
/// writer is attached, handed to it together with its encoded length.
pub struct Hasher<'a> {
    writer: Option<&'a dyn NodeWriter>,
}

impl<'a> Hasher<'a> {
    pub fn new() -> Self {
        Self { writer: None }
    }

    pub fn with_writer(writer: &'a dyn NodeWriter) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Returns the root hash. The root is always hashed and stored even when
    /// its encoding is small enough to be embedded.
    pub fn hash_root(&self, root: &Node) -> Result<H256, TrieError> {
        match self.hash(root, true)? {
            Node::Hash(hash) => Ok(hash),
            // Value nodes are never roots
            other => Ok(keccak(other.encode_to_vec())),
        }
    }

    /// Returns the reference that replaces `node` inside its parent.
    pub fn hash(&self, node: &Node, force: bool) -> Result<Node, TrieError> {
        let collapsed = match node {
            Node::Hash(_) | Node::Value(_) => return Ok(node.clone()),
            Node::Short(short) => {
                let val = match short.val.as_ref() {
                    Node::Value(v) => Node::Value(v.clone()),
                    child => self.hash(child, false)?,
                };
                Node::Short(ShortNode::new(short.key.clone(), val))
            }
            Node::Full(full) => {
                let mut collapsed = FullNode::default();
                for (slot, child) in full.children.iter().enumerate() {
                    if let Some(child) = child {
                        collapsed.children[slot] = Some(self.hash(child, false)?);
                    }
                }
                collapsed.into()
            }
        };
        let encoded = collapsed.encode_to_vec();
        if encoded.len() < MAX_EMBEDDED_SIZE && !force {
            return Ok(collapsed);
        }
        let hash = keccak(&encoded);
        if let Some(writer) = self.writer {
            let len = u16::try_from(encoded.len()).unwrap_or(u16::MAX);
            writer.insert_node(hash, len, collapsed)?;
        }
        Ok(Node::Hash(hash))
    }
}

impl Default for Hasher<'_> {
    fn default() -> Self {
        Self::new()
    }
}
