pub mod api;
pub mod backend;
pub mod error;
pub mod keys;
pub mod metrics;

pub use api::{IDEAL_BATCH_SIZE, KeyValueStore, PrefixResult, WriteBatch, write_batch_over_threshold};
pub use backend::{InMemoryStore, StoreNodeReader};
pub use error::StoreError;
pub use keys::{CODE_PREFIX, CodeKey, PREIMAGE_PREFIX, PreimageKey};
