use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis endpoint not specified")]
    RedisNoEndpoint,
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to encode cache snapshot: {0}")]
    Snapshot(#[from] bincode::Error),
    #[error("Snapshot worker panicked")]
    SnapshotWorker,
    #[error("Unknown cache type: {0}")]
    UnknownCacheType(String),
    #[error("Block subscription already active")]
    AlreadySubscribed,
}
