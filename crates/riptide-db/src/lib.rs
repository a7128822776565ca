//! Key/value store abstraction for riptide.
//!
//! The ledger core persists Merkle tree nodes, the committed root hash, the
//! view ID, and audit records through this interface. Keys are opaque byte
//! strings; the core reserves the single-byte prefixes `0x01..0x04` for
//! account kinds and the byte strings `account_`, `deltas_` and
//! `wallet_nonce_`.
//!
//! # Example
//!
//! ```
//! use riptide_db::{KeyValueReader, KeyValueWriter, MemStore};
//!
//! let store = MemStore::new();
//! store.put(b"key", b"value").unwrap();
//! assert_eq!(store.get(b"key").unwrap(), Some(b"value".to_vec()));
//! ```

mod error;
mod memstore;

pub use error::{Result, StoreError};
pub use memstore::MemStore;

/// A key-value reader.
pub trait KeyValueReader: Send + Sync {
    /// Returns whether the key exists in the store.
    fn has(&self, key: &[u8]) -> Result<bool>;

    /// Gets the value for the given key.
    /// Returns `Ok(None)` if the key does not exist.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// A key-value writer.
pub trait KeyValueWriter: Send + Sync {
    /// Sets the value for the given key.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// A key-value deleter.
pub trait KeyValueDeleter: Send + Sync {
    /// Deletes the value for the given key.
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Batch creation interface.
pub trait Batcher: Send + Sync {
    /// Creates a new batch for atomic writes.
    fn new_batch(&self) -> Box<dyn Batch>;
}

/// The main store interface combining all capabilities.
pub trait Store: KeyValueReader + KeyValueWriter + KeyValueDeleter + Batcher {
    /// Closes the store.
    fn close(&self) -> Result<()>;

    /// Returns whether the store is closed.
    fn is_closed(&self) -> bool;
}

/// A batch of write operations to be applied atomically.
pub trait Batch: Send + Sync {
    /// Stages a put into the batch.
    fn put(&mut self, key: &[u8], value: &[u8]);

    /// Stages a delete into the batch.
    fn delete(&mut self, key: &[u8]);

    /// Returns the staged size of the batch in bytes.
    fn size(&self) -> usize;

    /// Writes the batch to the store.
    fn write(&mut self) -> Result<()>;

    /// Resets the batch for reuse.
    fn reset(&mut self);
}
