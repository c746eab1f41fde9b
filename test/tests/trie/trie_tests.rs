use ethereum_types::H256;
use hex_literal::hex;
use std::sync::Arc;
use triedb_trie::{EMPTY_TRIE_HASH, InMemoryNodeStore, Node, NodeReader, Trie};

#[test]
fn empty_trie_root() {
    let trie = Trie::new_temp();
    assert_eq!(
        trie.hash_no_commit().unwrap(),
        H256(hex!(
            "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
        ))
    );
    assert_eq!(trie.hash_no_commit().unwrap(), *EMPTY_TRIE_HASH);
}

#[test]
fn known_root() {
    let mut trie = Trie::new_temp();
    for (key, value) in [
        ("do", "verb"),
        ("dog", "puppy"),
        ("doge", "coin"),
        ("horse", "stallion"),
    ] {
        trie.insert(key.as_bytes().to_vec(), value.as_bytes().to_vec())
            .unwrap();
    }
    assert_eq!(
        trie.hash_no_commit().unwrap(),
        H256(hex!(
            "5991bb8c6514148a29db676a14ac506cd2cd5775ace63c30a4fe457715e9ac84"
        ))
    );
}

#[test]
fn small_nodes_stay_embedded() {
    let store = InMemoryNodeStore::new_empty();
    let mut trie = Trie::new(Arc::new(store.clone()));
    trie.insert(b"a".to_vec(), b"1".to_vec()).unwrap();
    trie.insert(b"b".to_vec(), b"2".to_vec()).unwrap();
    let root = trie.commit(&store).unwrap();

    // only the root is stored, everything below is inlined
    assert_eq!(store.len(), 1);
    let encoded = store.node(root).unwrap().unwrap();
    assert!(encoded.len() < 32);
    assert!(Node::decode(&encoded).unwrap().child_hashes().is_empty());

    let reopened = Trie::open(Arc::new(store), root);
    assert_eq!(reopened.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(reopened.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(reopened.get(b"c").unwrap(), None);
}

#[test]
fn committed_trie_reopens() {
    let store = InMemoryNodeStore::new_empty();
    let mut trie = Trie::new(Arc::new(store.clone()));
    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..200u32)
        .map(|i| (i.to_be_bytes().to_vec(), vec![i as u8; 40]))
        .collect();
    for (key, value) in &entries {
        trie.insert(key.clone(), value.clone()).unwrap();
    }
    let root = trie.commit(&store).unwrap();

    let reopened = Trie::open(Arc::new(store), root);
    assert_eq!(reopened.entries().unwrap(), entries);
}
