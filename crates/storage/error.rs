use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Custom(String),
    #[error("database closed")]
    Closed,
    #[error("Failed to acquire database lock")]
    LockError,
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}
