//! Error types for the tree.

use riptide_db::StoreError;
use thiserror::Error;

/// Result type for tree operations.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors that can occur during tree operations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A diff byte stream could not be decoded or grafted.
    #[error("invalid diff: {0}")]
    InvalidDiff(String),

    /// A node referenced by hash was not found in memory or in the store.
    #[error("missing node {0}")]
    MissingNode(String),

    /// An error from the backing store.
    #[error(transparent)]
    Store(#[from] StoreError),
}
