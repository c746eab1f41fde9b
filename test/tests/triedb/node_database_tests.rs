use ethereum_types::H256;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};
use triedb::NodeDatabase;
use triedb_storage::{InMemoryStore, KeyValueStore, PreimageKey, StoreNodeReader};
use triedb_trie::{Node, NodeReader, Trie, keccak};

fn open() -> (InMemoryStore, Arc<NodeDatabase>) {
    let disk = InMemoryStore::open();
    let db = Arc::new(NodeDatabase::new(Arc::new(disk.clone())).unwrap());
    (disk, db)
}

fn random_entries(rng: &mut StdRng, count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..count)
        .map(|_| {
            let key: [u8; 32] = rng.r#gen();
            let value: [u8; 20] = rng.r#gen();
            (key.to_vec(), value.to_vec())
        })
        .collect()
}

/// Stages `entries` on top of the trie at `base` and anchors the new root.
fn stage(db: &Arc<NodeDatabase>, base: Option<H256>, entries: &[(Vec<u8>, Vec<u8>)]) -> H256 {
    let mut trie = match base {
        Some(root) => Trie::open(db.clone(), root),
        None => Trie::new(db.clone()),
    };
    for (key, value) in entries {
        trie.insert(key.clone(), value.clone()).unwrap();
    }
    let root = trie.commit(db.as_ref()).unwrap();
    db.reference_root(root).unwrap();
    root
}

/// Every hash reachable from `root`, each one decoded from `reader`.
fn reachable(reader: &dyn NodeReader, root: H256) -> HashSet<H256> {
    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(hash) = stack.pop() {
        if !seen.insert(hash) {
            continue;
        }
        let encoded = reader.node(hash).unwrap().unwrap();
        stack.extend(Node::decode(&encoded).unwrap().child_hashes());
    }
    seen
}

fn disk_hashes(disk: &InMemoryStore) -> HashSet<H256> {
    disk.keys()
        .unwrap()
        .into_iter()
        .filter(|key| key.len() == 32)
        .map(|key| H256::from_slice(&key))
        .collect()
}

#[test]
fn commit_writes_exactly_the_reachable_nodes() {
    let mut rng = StdRng::seed_from_u64(1);
    let (disk, db) = open();
    let old_root = stage(&db, None, &random_entries(&mut rng, 300));
    let new_root = stage(&db, Some(old_root), &random_entries(&mut rng, 60));

    db.dereference(old_root).unwrap();
    db.commit(new_root, true, 1).unwrap();
    db.verify_integrity().unwrap();

    let reader = StoreNodeReader::new(Arc::new(disk.clone()));
    assert_eq!(disk_hashes(&disk), reachable(&reader, new_root));
    assert!(db.nodes().unwrap().is_empty());
    assert_eq!(db.memory_footprint().unwrap(), 0);
}

#[test]
fn dereference_and_restage_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(2);
    let (_, db) = open();
    let base = stage(&db, None, &random_entries(&mut rng, 200));
    let extra = random_entries(&mut rng, 30);
    let top = stage(&db, Some(base), &extra);

    let nodes_before: BTreeSet<H256> = db.nodes().unwrap().into_iter().collect();
    let size_before = db.size().unwrap();

    db.dereference(top).unwrap();
    assert!(db.nodes().unwrap().len() < nodes_before.len());
    // the base trie is still anchored
    assert!(db.does_exist_cached_node(base).unwrap());

    assert_eq!(stage(&db, Some(base), &extra), top);
    let nodes_after: BTreeSet<H256> = db.nodes().unwrap().into_iter().collect();
    assert_eq!(nodes_after, nodes_before);
    assert_eq!(db.size().unwrap(), size_before);
}

#[test]
fn capped_nodes_complete_on_commit() {
    let mut rng = StdRng::seed_from_u64(3);
    let (disk, db) = open();
    let entries = random_entries(&mut rng, 2_000);
    let root = stage(&db, None, &entries);
    let footprint = db.memory_footprint().unwrap();

    db.cap(footprint / 4).unwrap();
    assert!(db.memory_footprint().unwrap() <= footprint / 4);
    assert!(!disk.is_empty().unwrap());

    db.commit(root, false, 0).unwrap();
    let reader = StoreNodeReader::new(Arc::new(disk.clone()));
    let trie = Trie::open(Arc::new(reader), root);
    for (key, value) in &entries {
        assert_eq!(trie.get(key).unwrap().as_ref(), Some(value));
    }
    // every stored child is itself stored
    let stored = disk_hashes(&disk);
    for hash in &stored {
        let encoded = disk.get(hash.as_bytes()).unwrap().unwrap();
        for child in Node::decode(&encoded).unwrap().child_hashes() {
            assert!(stored.contains(&child));
        }
    }
}

#[test]
fn large_preimage_sets_flush_on_cap() {
    let (disk, db) = open();
    let preimages: Vec<(H256, Vec<u8>)> = (0..5u8)
        .map(|i| {
            let key = vec![i; 1024 * 1024];
            (keccak(&key), key)
        })
        .collect();
    for (hash, key) in &preimages {
        db.insert_preimage(*hash, key).unwrap();
    }
    db.cap(u64::MAX).unwrap();

    assert_eq!(db.size().unwrap(), (0, 0));
    for (hash, key) in &preimages {
        assert!(disk.has(PreimageKey::new(hash).as_ref()).unwrap());
        assert_eq!(db.preimage(*hash).unwrap().as_ref(), Some(key));
    }
}

#[test]
fn readers_see_every_node_while_committing() {
    let mut rng = StdRng::seed_from_u64(4);
    let (_, db) = open();
    let root = stage(&db, None, &random_entries(&mut rng, 1_000));
    let hashes: Vec<H256> = db.nodes().unwrap();

    std::thread::scope(|scope| {
        let readers: Vec<_> = (0..4)
            .map(|offset| {
                let (db, hashes) = (&db, &hashes);
                scope.spawn(move || {
                    for round in 0..3 {
                        for hash in hashes.iter().skip((offset + round) % 4).step_by(4) {
                            assert!(db.node(*hash).unwrap().is_some());
                        }
                    }
                })
            })
            .collect();
        db.commit(root, false, 0).unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    });
    assert!(db.nodes().unwrap().is_empty());
}

#[test]
fn empty_root_is_never_stored() {
    let (disk, db) = open();
    let root = stage(&db, None, &[]);
    assert_eq!(root, *triedb_trie::EMPTY_TRIE_HASH);
    db.commit(root, false, 0).unwrap();
    assert!(disk.is_empty().unwrap());
}
