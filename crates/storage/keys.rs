//! Fixed-size composite keys used on disk.
//!
//! Trie nodes are stored under their bare 32-byte hash. Raw (code) entries
//! and preimages carry a prefix so they never collide with node keys.

use ethereum_types::H256;

/// Prefix of preimage keys: `"secure-key-" ++ hash`.
pub const PREIMAGE_PREFIX: &[u8; 11] = b"secure-key-";

/// Prefix of raw entries fetched by trie sync: `"c" ++ hash`.
pub const CODE_PREFIX: &[u8; 1] = b"c";

/// 43-byte key holding the preimage of a secure-trie key hash.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PreimageKey([u8; 43]);

impl PreimageKey {
    #[inline]
    pub fn new(hash: &H256) -> Self {
        let mut key = [0u8; 43];
        key[..11].copy_from_slice(PREIMAGE_PREFIX);
        key[11..].copy_from_slice(hash.as_bytes());
        Self(key)
    }
}

impl AsRef<[u8]> for PreimageKey {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// 33-byte key for an opaque raw entry (contract code).
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct CodeKey([u8; 33]);

impl CodeKey {
    #[inline]
    pub fn new(hash: &H256) -> Self {
        let mut key = [0u8; 33];
        key[..1].copy_from_slice(CODE_PREFIX);
        key[1..].copy_from_slice(hash.as_bytes());
        Self(key)
    }

    /// Extracts the hash back out of a code key, if `key` is one.
    pub fn parse(key: &[u8]) -> Option<H256> {
        (key.len() == 33 && key.starts_with(CODE_PREFIX)).then(|| H256::from_slice(&key[1..]))
    }
}

impl AsRef<[u8]> for CodeKey {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
