mod trie {
    mod nibbles_tests;
    mod trie_tests;
}

mod triedb {
    mod node_database_tests;
}

mod cache {
    mod node_cache_tests;
}

mod sync {
    mod trie_sync_tests;
}
