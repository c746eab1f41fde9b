// RLP encoding and decoding of collapsed trie nodes.
// Short nodes encode as `[compact(key), child]`, full nodes as a 17 item list.
use alloy_rlp::{EMPTY_STRING_CODE, Encodable, Header};
use ethereum_types::H256;

use crate::{
    error::TrieError,
    nibbles::Nibbles,
    node::{FULL_NODE_SLOTS, FullNode, Node, ShortNode},
};

/// Largest encoding a child may have and still be embedded in its parent.
pub const MAX_EMBEDDED_SIZE: usize = 32;

impl Node {
    /// Encodes the node. Children must already be collapsed.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        encode_node(self, &mut buf);
        buf
    }

    /// Decodes a stored node, rejecting trailing bytes.
    pub fn decode(buf: &[u8]) -> Result<Node, TrieError> {
        let (item, rest) = split_item(buf)?;
        if !rest.is_empty() {
            return Err(TrieError::InvalidNode(format!(
                "{} trailing bytes after node",
                rest.len()
            )));
        }
        if !item.list {
            return Err(TrieError::InvalidNode("expected list".to_string()));
        }
        let elems = list_items(item.payload)?;
        match elems.len() {
            2 => decode_short(&elems),
            FULL_NODE_SLOTS => decode_full(&elems),
            n => Err(TrieError::InvalidNode(format!(
                "invalid number of list elements: {n}"
            ))),
        }
    }
}

fn encode_node(node: &Node, buf: &mut Vec<u8>) {
    match node {
        Node::Short(short) => {
            let mut payload = Vec::with_capacity(64);
            <[u8] as Encodable>::encode(&short.key.encode_compact(), &mut payload);
            encode_node(&short.val, &mut payload);
            write_list(&payload, buf);
        }
        Node::Full(full) => {
            let mut payload = Vec::with_capacity(FULL_NODE_SLOTS * 33);
            for child in full.children.iter() {
                match child {
                    Some(child) => encode_node(child, &mut payload),
                    None => payload.push(EMPTY_STRING_CODE),
                }
            }
            write_list(&payload, buf);
        }
        Node::Hash(hash) => <[u8] as Encodable>::encode(hash.as_bytes(), buf),
        Node::Value(value) => <[u8] as Encodable>::encode(value, buf),
    }
}

fn write_list(payload: &[u8], buf: &mut Vec<u8>) {
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(buf);
    buf.extend_from_slice(payload);
}

struct Item<'a> {
    raw: &'a [u8],
    list: bool,
    payload: &'a [u8],
}

fn split_item(buf: &[u8]) -> Result<(Item<'_>, &[u8]), TrieError> {
    let mut cursor = buf;
    let header = Header::decode(&mut cursor)?;
    let header_len = buf.len() - cursor.len();
    if cursor.len() < header.payload_length {
        return Err(alloy_rlp::Error::InputTooShort.into());
    }
    let end = header_len + header.payload_length;
    let item = Item {
        raw: &buf[..end],
        list: header.list,
        payload: &buf[header_len..end],
    };
    Ok((item, &buf[end..]))
}

fn list_items(mut payload: &[u8]) -> Result<Vec<Item<'_>>, TrieError> {
    let mut items = Vec::with_capacity(FULL_NODE_SLOTS);
    while !payload.is_empty() {
        let (item, rest) = split_item(payload)?;
        items.push(item);
        payload = rest;
    }
    Ok(items)
}

fn decode_short(elems: &[Item<'_>]) -> Result<Node, TrieError> {
    if elems[0].list {
        return Err(TrieError::InvalidNode("short node key is a list".to_string()));
    }
    let key = Nibbles::decode_compact(elems[0].payload);
    let val = if key.is_leaf() {
        if elems[1].list {
            return Err(TrieError::InvalidNode("leaf value is a list".to_string()));
        }
        Node::Value(elems[1].payload.to_vec())
    } else {
        decode_ref(&elems[1])?
            .ok_or_else(|| TrieError::InvalidNode("empty extension child".to_string()))?
    };
    Ok(ShortNode::new(key, val).into())
}

fn decode_full(elems: &[Item<'_>]) -> Result<Node, TrieError> {
    let mut node = FullNode::default();
    for (slot, elem) in elems[..FULL_NODE_SLOTS - 1].iter().enumerate() {
        node.children[slot] = decode_ref(elem)?;
    }
    let value = &elems[FULL_NODE_SLOTS - 1];
    if value.list {
        return Err(TrieError::InvalidNode("full node value is a list".to_string()));
    }
    if !value.payload.is_empty() {
        node.children[FULL_NODE_SLOTS - 1] = Some(Node::Value(value.payload.to_vec()));
    }
    Ok(node.into())
}

fn decode_ref(item: &Item<'_>) -> Result<Option<Node>, TrieError> {
    if item.list {
        if item.raw.len() > MAX_EMBEDDED_SIZE {
            return Err(TrieError::InvalidNode(format!(
                "oversized embedded node (size is {}, should be < {MAX_EMBEDDED_SIZE})",
                item.raw.len()
            )));
        }
        return Node::decode(item.raw).map(Some);
    }
    match item.payload.len() {
        0 => Ok(None),
        32 => Ok(Some(Node::Hash(H256::from_slice(item.payload)))),
        n => Err(TrieError::InvalidNode(format!(
            "invalid RLP string size {n} (want 0 or 32)"
        ))),
    }
}
