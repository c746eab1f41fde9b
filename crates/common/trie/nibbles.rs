use std::cmp;

/// Nibble terminator marking a path that ends at a value.
pub const TERMINATOR: u8 = 16;

/// Hex-nibble key as stored inside short nodes.
///
/// Each element holds a value in `0..=16`; a trailing `16` marks a leaf key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Nibbles {
    data: Vec<u8>,
}

impl PartialOrd for Nibbles {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Nibbles {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.data.cmp(&other.data)
    }
}

impl Nibbles {
    /// Wraps an already expanded nibble sequence
    pub fn from_hex(hex: Vec<u8>) -> Self {
        Self { data: hex }
    }

    /// Splits bytes into nibbles and appends the leaf terminator
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_hex(keybytes_to_hex(bytes))
    }

    /// Splits bytes into nibbles without adding a terminator
    pub fn from_raw(bytes: &[u8], is_leaf: bool) -> Self {
        let mut data = keybytes_to_hex(bytes);
        if !is_leaf {
            data.pop();
        }
        Self { data }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of the common prefix between `self` and `other`
    pub fn count_prefix(&self, other: &Nibbles) -> usize {
        prefix_len(&self.data, &other.data)
    }

    pub fn starts_with(&self, prefix: &Nibbles) -> bool {
        self.data.starts_with(&prefix.data)
    }

    /// Returns the nibbles after `offset`
    pub fn offset(&self, offset: usize) -> Nibbles {
        self.slice(offset, self.len())
    }

    pub fn slice(&self, start: usize, end: usize) -> Nibbles {
        Nibbles::from_hex(self.data[start..end].to_vec())
    }

    pub fn at(&self, i: usize) -> usize {
        self.data[i] as usize
    }

    pub fn append(&mut self, nibble: u8) {
        self.data.push(nibble);
    }

    pub fn extend(&mut self, other: &Nibbles) {
        self.data.extend_from_slice(&other.data);
    }

    /// Concatenates self and another Nibbles returning a new Nibbles
    pub fn concat(&self, other: &Nibbles) -> Nibbles {
        let mut data = self.data.clone();
        data.extend_from_slice(&other.data);
        Nibbles::from_hex(data)
    }

    /// Returns a copy of self with the nibble added at the end
    pub fn append_new(&self, nibble: u8) -> Nibbles {
        let mut data = self.data.clone();
        data.push(nibble);
        Nibbles::from_hex(data)
    }

    /// Encodes the nibbles in compact form
    pub fn encode_compact(&self) -> Vec<u8> {
        hex_to_compact(&self.data)
    }

    /// Decodes a compact encoded key back into nibbles
    pub fn decode_compact(compact: &[u8]) -> Self {
        Self::from_hex(compact_to_hex(compact))
    }

    /// Returns true if the nibbles contain the leaf flag (16) at the end
    pub fn is_leaf(&self) -> bool {
        has_term(&self.data)
    }

    /// Combines the nibbles into bytes, trimming the leaf flag if necessary
    pub fn to_bytes(&self) -> Vec<u8> {
        hex_to_keybytes(&self.data)
    }
}

impl AsRef<[u8]> for Nibbles {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

pub fn has_term(hex: &[u8]) -> bool {
    hex.last() == Some(&TERMINATOR)
}

pub fn prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

// node type    path length    |    prefix    hexchar
// --------------------------------------------------
// extension    even           |    0000      0x0
// extension    odd            |    0001      0x1
// leaf         even           |    0010      0x2
// leaf         odd            |    0011      0x3
pub fn hex_to_compact(hex: &[u8]) -> Vec<u8> {
    let is_leaf = has_term(hex);
    let mut hex = if is_leaf { &hex[..hex.len() - 1] } else { hex };
    let mut compact = Vec::with_capacity(hex.len() / 2 + 1);
    let mut flag = if is_leaf { 0x20 } else { 0x00 };
    if hex.len() % 2 == 1 {
        flag |= 0x10 | hex[0];
        hex = &hex[1..];
    }
    compact.push(flag);
    for pair in hex.chunks(2) {
        compact.push((pair[0] << 4) | pair[1]);
    }
    compact
}

pub fn compact_to_hex(compact: &[u8]) -> Vec<u8> {
    if compact.is_empty() {
        return vec![];
    }
    let mut base = keybytes_to_hex(compact);
    // delete terminator flag
    if base[0] < 2 {
        base.truncate(base.len() - 1);
    }
    // apply odd flag
    let chop = 2 - (base[0] & 1) as usize;
    base[chop..].to_vec()
}

pub fn keybytes_to_hex(keybytes: &[u8]) -> Vec<u8> {
    let l = keybytes.len() * 2 + 1;
    let mut nibbles = vec![0; l];
    for (i, b) in keybytes.iter().enumerate() {
        nibbles[i * 2] = b / 16;
        nibbles[i * 2 + 1] = b % 16;
    }
    nibbles[l - 1] = TERMINATOR;
    nibbles
}

/// Packs nibbles into bytes. A dangling odd nibble lands in the high half
/// of the last byte.
pub fn hex_to_keybytes(hex: &[u8]) -> Vec<u8> {
    let hex = if has_term(hex) { &hex[..hex.len() - 1] } else { hex };
    hex.chunks(2)
        .map(|chunk| match chunk.len() {
            1 => chunk[0] << 4,
            _ => (chunk[0] << 4) | chunk[1],
        })
        .collect()
}
