use proptest::prelude::*;
use triedb_trie::{
    Nibbles,
    nibbles::{compact_to_hex, hex_to_compact, hex_to_keybytes, keybytes_to_hex},
};

#[test]
fn count_prefix_all() {
    let a = Nibbles::from_hex(vec![1, 2, 3, 4, 5]);
    let b = Nibbles::from_hex(vec![1, 2, 3, 4, 5]);
    assert_eq!(a.count_prefix(&b), a.len());
}

#[test]
fn count_prefix_partial() {
    let a = Nibbles::from_hex(vec![1, 2, 3, 4, 5]);
    let b = Nibbles::from_hex(vec![1, 2, 3]);
    assert_eq!(a.count_prefix(&b), b.len());
}

#[test]
fn count_prefix_none() {
    let a = Nibbles::from_hex(vec![1, 2, 3, 4, 5]);
    let b = Nibbles::from_hex(vec![2, 3, 4, 5, 6]);
    assert_eq!(a.count_prefix(&b), 0);
}

#[test]
fn offset_and_slice() {
    let a = Nibbles::from_hex(vec![1, 2, 3, 4, 5]);
    assert_eq!(a.offset(2).as_ref(), &[3, 4, 5]);
    assert_eq!(a.slice(1, 3).as_ref(), &[2, 3]);
    assert_eq!(a.at(4), 5);
    assert!(a.starts_with(&a.slice(0, 2)));
    assert!(!a.starts_with(&a.offset(1)));
}

#[test]
fn from_bytes_is_a_leaf() {
    let key = Nibbles::from_bytes(&[0xab, 0xcd]);
    assert_eq!(key.as_ref(), &[0xa, 0xb, 0xc, 0xd, 16]);
    assert!(key.is_leaf());
    assert_eq!(key.to_bytes(), vec![0xab, 0xcd]);
    assert!(!Nibbles::from_raw(&[0xab], false).is_leaf());
}

#[test]
fn concat_and_append() {
    let a = Nibbles::from_hex(vec![1, 2]);
    let b = Nibbles::from_hex(vec![3]);
    assert_eq!(a.concat(&b).as_ref(), &[1, 2, 3]);
    assert_eq!(a.append_new(9).as_ref(), &[1, 2, 9]);
    assert_eq!(a.as_ref(), &[1, 2]);
}

#[test]
fn compact_encoding_flags() {
    // even extension, odd extension, even leaf, odd leaf
    assert_eq!(hex_to_compact(&[1, 2, 3, 4]), vec![0x00, 0x12, 0x34]);
    assert_eq!(hex_to_compact(&[1, 2, 3]), vec![0x11, 0x23]);
    assert_eq!(hex_to_compact(&[1, 2, 16]), vec![0x20, 0x12]);
    assert_eq!(hex_to_compact(&[0xf, 1, 0xc, 0xb, 8, 16]), vec![0x3f, 0x1c, 0xb8]);
    assert_eq!(hex_to_compact(&[]), vec![0x00]);
}

proptest! {
    #[test]
    fn compact_round_trips(hex in proptest::collection::vec(0u8..16, 0..70), leaf: bool) {
        let mut hex = hex;
        if leaf {
            hex.push(16);
        }
        prop_assert_eq!(compact_to_hex(&hex_to_compact(&hex)), hex);
    }

    #[test]
    fn keybytes_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..40)) {
        let hex = keybytes_to_hex(&bytes);
        prop_assert_eq!(hex.len(), bytes.len() * 2 + 1);
        prop_assert_eq!(hex_to_keybytes(&hex), bytes);
    }
}
