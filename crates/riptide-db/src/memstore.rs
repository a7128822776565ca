//! In-memory store implementation.
//!
//! A simple in-memory key-value store backed by a `BTreeMap`. It is the
//! default backing store for tests and for nodes running without
//! persistence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Batch, Batcher, KeyValueDeleter, KeyValueReader, KeyValueWriter, Result, Store, StoreError};

/// An in-memory key-value store.
///
/// Thread-safe via `RwLock`. All values are cloned on read/write.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MemStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl KeyValueReader for MemStore {
    fn has(&self, key: &[u8]) -> Result<bool> {
        self.check_closed()?;
        Ok(self.data.read().contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_closed()?;
        Ok(self.data.read().get(key).cloned())
    }
}

impl KeyValueWriter for MemStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_closed()?;
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

impl KeyValueDeleter for MemStore {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_closed()?;
        self.data.write().remove(key);
        Ok(())
    }
}

impl Batcher for MemStore {
    fn new_batch(&self) -> Box<dyn Batch> {
        Box::new(MemBatch {
            data: self.data.clone(),
            closed: self.closed.clone(),
            ops: Vec::new(),
            size: 0,
            written: false,
        })
    }
}

impl Store for MemStore {
    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A staged operation (put or delete).
#[derive(Debug, Clone)]
enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A batch of operations for `MemStore`.
///
/// Collects operations and applies them atomically when written.
struct MemBatch {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    closed: Arc<AtomicBool>,
    ops: Vec<BatchOp>,
    size: usize,
    written: bool,
}

impl Batch for MemBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.size += key.len() + value.len();
        self.ops.push(BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    fn delete(&mut self, key: &[u8]) {
        self.size += key.len();
        self.ops.push(BatchOp::Delete { key: key.to_vec() });
    }

    fn size(&self) -> usize {
        self.size
    }

    fn write(&mut self) -> Result<()> {
        if self.written {
            return Err(StoreError::BatchAlreadyWritten);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        let mut data = self.data.write();
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    data.remove(key);
                }
            }
        }
        self.written = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.ops.clear();
        self.size = 0;
        self.written = false;
    }
}
