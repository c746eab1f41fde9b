pub mod in_memory;
mod trie_adapter;

pub use in_memory::InMemoryStore;
pub use trie_adapter::StoreNodeReader;
