//! Error types for the store layer.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// The batch has already been written.
    #[error("batch already written")]
    BatchAlreadyWritten,

    /// An I/O error from the backing store.
    #[error("store I/O error: {0}")]
    Io(String),
}
