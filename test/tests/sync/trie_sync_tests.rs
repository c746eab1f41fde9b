use ethereum_types::H256;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};
use triedb_storage::{InMemoryStore, KeyValueStore, StoreNodeReader};
use triedb_sync::{SyncBloom, SyncError, SyncResult, TrieSync};
use triedb_trie::{InMemoryNodeStore, Node, NodeReader, Trie};

type Entries = BTreeMap<Vec<u8>, Vec<u8>>;

fn insert_random(trie: &mut Trie, entries: &mut Entries, count: usize, rng: &mut StdRng) {
    for _ in 0..count {
        let key: [u8; 32] = rng.r#gen();
        let value: [u8; 24] = rng.r#gen();
        trie.insert(key.to_vec(), value.to_vec()).unwrap();
        entries.insert(key.to_vec(), value.to_vec());
    }
}

fn source_trie(count: usize, seed: u64) -> (InMemoryNodeStore, H256, Entries) {
    let mut rng = StdRng::seed_from_u64(seed);
    let source = InMemoryNodeStore::new_empty();
    let mut trie = Trie::new(Arc::new(source.clone()));
    let mut entries = Entries::new();
    insert_random(&mut trie, &mut entries, count, &mut rng);
    let root = trie.commit(&source).unwrap();
    (source, root, entries)
}

fn serve(source: &InMemoryNodeStore, hashes: &[H256]) -> Vec<SyncResult> {
    hashes
        .iter()
        .map(|hash| SyncResult {
            hash: *hash,
            data: source.node(*hash).unwrap().unwrap(),
        })
        .collect()
}

fn flush(sync: &mut TrieSync, dest: &InMemoryStore) {
    let mut batch = dest.new_batch();
    sync.commit(batch.as_mut()).unwrap();
    batch.write().unwrap();
}

fn read_back(dest: &InMemoryStore, root: H256) -> Entries {
    let reader = StoreNodeReader::new(Arc::new(dest.clone()));
    Trie::open(Arc::new(reader), root)
        .entries()
        .unwrap()
        .into_iter()
        .collect()
}

fn reachable(source: &InMemoryNodeStore, root: H256) -> HashSet<H256> {
    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(hash) = stack.pop() {
        if !seen.insert(hash) {
            continue;
        }
        let enc = source.node(hash).unwrap().unwrap();
        stack.extend(Node::decode(&enc).unwrap().child_hashes());
    }
    seen
}

/// Every stored node has all of its hash children stored as well.
fn assert_subtrees_complete(dest: &InMemoryStore) {
    for key in dest.keys().unwrap() {
        let enc = dest.get(&key).unwrap().unwrap();
        for child in Node::decode(&enc).unwrap().child_hashes() {
            assert!(
                dest.has(child.as_bytes()).unwrap(),
                "node {} stored without child {child:#x}",
                hex::encode(&key)
            );
        }
    }
}

#[test]
fn syncs_large_trie_in_bounded_requests() {
    let (source, root, entries) = source_trie(4096, 10);
    let dest = InMemoryStore::open();
    let mut sync = TrieSync::new(root, Arc::new(dest.clone()), None, None, None).unwrap();

    loop {
        let hashes = sync.missing(100);
        if hashes.is_empty() {
            break;
        }
        assert!(hashes.len() <= 100);
        sync.process(&serve(&source, &hashes)).unwrap();
        flush(&mut sync, &dest);
    }

    assert_eq!(sync.pending(), 0);
    assert_eq!(dest.len().unwrap(), source.len());
    assert_eq!(read_back(&dest, root), entries);
    assert!((sync.calc_progress_percentage() - 100.0).abs() < f64::EPSILON);
}

#[test]
fn random_partial_delivery_writes_each_node_once() {
    let (source, root, entries) = source_trie(1500, 11);
    let dest = InMemoryStore::open();
    let mut sync = TrieSync::new(root, Arc::new(dest.clone()), None, None, None).unwrap();
    let mut rng = StdRng::seed_from_u64(12);

    let mut backlog: Vec<H256> = Vec::new();
    loop {
        backlog.extend(sync.missing(0));
        if backlog.is_empty() {
            break;
        }
        backlog.shuffle(&mut rng);
        let delivered = backlog.split_off(backlog.len() / 2);
        sync.process(&serve(&source, &delivered)).unwrap();
        flush(&mut sync, &dest);
        assert_subtrees_complete(&dest);
    }

    assert_eq!(sync.pending(), 0);
    assert_eq!(read_back(&dest, root), entries);
    let written = dest.metrics().snapshot().keys_written;
    assert_eq!(written, dest.len().unwrap() as u64);
}

#[test]
fn undecodable_result_is_rejected_and_retried() {
    let (source, root, entries) = source_trie(500, 13);
    let dest = InMemoryStore::open();
    let mut sync = TrieSync::new(root, Arc::new(dest.clone()), None, None, None).unwrap();
    let first = sync.missing(0);
    sync.process(&serve(&source, &first)).unwrap();

    let hashes = sync.missing(0);
    assert!(hashes.len() > 2);
    let mut results = serve(&source, &hashes);
    let len = results[1].data.len();
    results[1].data.truncate(len / 2);

    let err = sync.process(&results).unwrap_err();
    assert_eq!(err.index, 1);
    assert!(matches!(err.source, SyncError::Decode { hash, .. } if hash == hashes[1]));

    sync.process(&serve(&source, &hashes[1..])).unwrap();
    flush(&mut sync, &dest);
    loop {
        let hashes = sync.missing(64);
        if hashes.is_empty() {
            break;
        }
        sync.process(&serve(&source, &hashes)).unwrap();
        flush(&mut sync, &dest);
    }
    assert_eq!(read_back(&dest, root), entries);
}

#[test]
fn resumed_sync_fetches_only_new_nodes() {
    let (source, old_root, mut entries) = source_trie(800, 14);
    let dest = InMemoryStore::open();
    let mut sync = TrieSync::new(old_root, Arc::new(dest.clone()), None, None, None).unwrap();
    loop {
        let hashes = sync.missing(0);
        if hashes.is_empty() {
            break;
        }
        sync.process(&serve(&source, &hashes)).unwrap();
        flush(&mut sync, &dest);
    }

    let mut rng = StdRng::seed_from_u64(15);
    let mut trie = Trie::open(Arc::new(source.clone()), old_root);
    insert_random(&mut trie, &mut entries, 50, &mut rng);
    let new_root = trie.commit(&source).unwrap();

    let stored: HashSet<H256> = dest
        .keys()
        .unwrap()
        .iter()
        .map(|key| H256::from_slice(key))
        .collect();
    let expected: HashSet<H256> = reachable(&source, new_root)
        .difference(&stored)
        .copied()
        .collect();

    let bloom = Arc::new(SyncBloom::new(1));
    assert_eq!(bloom.init_from(&dest).unwrap(), stored.len());
    let mut sync =
        TrieSync::new(new_root, Arc::new(dest.clone()), None, Some(bloom), None).unwrap();
    let mut fetched = HashSet::new();
    loop {
        let hashes = sync.missing(0);
        if hashes.is_empty() {
            break;
        }
        fetched.extend(hashes.iter().copied());
        sync.process(&serve(&source, &hashes)).unwrap();
        flush(&mut sync, &dest);
    }

    assert_eq!(fetched, expected);
    assert_eq!(read_back(&dest, new_root), entries);
    assert_subtrees_complete(&dest);
}
