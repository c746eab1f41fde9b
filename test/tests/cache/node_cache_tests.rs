use ethereum_types::H256;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{sync::Arc, time::Duration};
use triedb::NodeDatabase;
use triedb_cache::{
    CacheType, HybridCache, LocalCache, RemoteCache, TrieNodeCache, TrieNodeCacheConfig,
    new_trie_node_cache,
};
use triedb_storage::InMemoryStore;
use triedb_trie::Trie;

fn unreachable_remote() -> RemoteCache {
    RemoteCache::new(&TrieNodeCacheConfig {
        cache_type: CacheType::Remote,
        redis_endpoints: vec!["127.0.0.1:9".to_string()],
        ..Default::default()
    })
    .unwrap()
}

fn assert_has_matches_get(cache: &dyn TrieNodeCache, rng: &mut StdRng) {
    let keys: Vec<H256> = (0..200).map(|_| H256::from(rng.r#gen::<[u8; 32]>())).collect();
    for (i, key) in keys.iter().enumerate() {
        if i % 3 != 0 {
            cache.set(*key, vec![i as u8; 64]);
        }
    }
    for key in &keys {
        if let Some(value) = cache.get(key) {
            assert_eq!(cache.has(key), Some(value));
        }
    }
}

#[test]
fn has_agrees_with_get() {
    let mut rng = StdRng::seed_from_u64(1);
    assert_has_matches_get(&LocalCache::new(1024 * 1024), &mut rng);

    let hybrid = HybridCache::new(LocalCache::new(1024 * 1024), unreachable_remote());
    assert_has_matches_get(&hybrid, &mut rng);
    hybrid.close().unwrap();
}

#[test]
fn flushed_nodes_are_served_from_cache() {
    let cache = LocalCache::new(16 * 1024 * 1024);
    let db = Arc::new(
        NodeDatabase::with_cache(
            Arc::new(InMemoryStore::open()),
            Some(Arc::new(cache.clone())),
        )
        .unwrap(),
    );
    let mut trie = Trie::new(db.clone());
    for i in 0..500u32 {
        trie.insert(i.to_be_bytes().to_vec(), vec![7; 40]).unwrap();
    }
    let root = trie.commit(db.as_ref()).unwrap();
    db.reference_root(root).unwrap();
    let staged = db.nodes().unwrap();

    db.cap(0).unwrap();
    assert!(db.nodes().unwrap().is_empty());
    for hash in &staged {
        assert!(cache.get(hash).is_some());
    }

    let hits = db.metrics().clean_hit.get();
    let reopened = Trie::open(db.clone(), root);
    assert_eq!(reopened.get(&42u32.to_be_bytes()).unwrap(), Some(vec![7; 40]));
    assert!(db.metrics().clean_hit.get() > hits);
}

#[test]
fn snapshot_survives_restart() {
    let base = tempfile::tempdir().unwrap();
    let config = TrieNodeCacheConfig {
        cache_type: CacheType::Local,
        local_cache_size_mib: 16,
        fast_cache_file_dir: Some(base.path().join("cache")),
        fast_cache_save_period: Duration::from_secs(3600),
        ..Default::default()
    };

    let disk = Arc::new(InMemoryStore::open());
    let db = Arc::new(NodeDatabase::with_cache_config(disk.clone(), config.clone()).unwrap());
    let mut trie = Trie::new(db.clone());
    for i in 0..100u32 {
        trie.insert(i.to_be_bytes().to_vec(), vec![1; 40]).unwrap();
    }
    let root = trie.commit(db.as_ref()).unwrap();
    db.reference_root(root).unwrap();
    db.commit(root, false, 0).unwrap();
    db.save_cache_to_file(&base.path().join("cache"), 3).unwrap();

    let restarted = NodeDatabase::with_cache_config(disk, config).unwrap();
    let cache = restarted.cache().unwrap();
    assert!(cache.get(&root).is_some());
    assert!(cache.update_stats().unwrap().entries > 0);
}

#[test]
fn disabled_cache_configs() {
    let config = TrieNodeCacheConfig::default();
    assert!(new_trie_node_cache(&config).unwrap().is_none());

    let no_endpoint = TrieNodeCacheConfig {
        cache_type: CacheType::Hybrid,
        local_cache_size_mib: 1,
        ..Default::default()
    };
    assert!(new_trie_node_cache(&no_endpoint).is_err());
}

#[test]
fn only_remote_tiers_offer_pubsub() {
    let local = LocalCache::new(1024);
    assert!(local.as_pubsub().is_none());
    let hybrid = HybridCache::new(LocalCache::new(1024), unreachable_remote());
    assert!(hybrid.as_pubsub().is_some());
    hybrid.close().unwrap();
}
