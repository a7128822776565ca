//! LRU cache over deserialized nodes.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use riptide_ids::Hash256;

use crate::Node;

/// A bounded, mutex-guarded cache of recently touched nodes, keyed by hash.
///
/// The bound is an entry count, not a byte count. The cache is shared by a
/// tree and all of its snapshots.
#[derive(Debug)]
pub struct NodeCache {
    inner: Mutex<LruCache<Hash256, Arc<Node>>>,
}

impl NodeCache {
    /// Creates a cache bounded to `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be non-zero"),
            )),
        }
    }

    /// Loads a node, marking it most recently used.
    #[must_use]
    pub fn load(&self, id: &Hash256) -> Option<Arc<Node>> {
        self.inner.lock().get(id).cloned()
    }

    /// Inserts a node, evicting the least recently used entry when full.
    pub fn put(&self, node: Arc<Node>) {
        self.inner.lock().put(node.id, node);
    }

    /// Removes a node from the cache.
    pub fn remove(&self, id: &Hash256) {
        self.inner.lock().pop(id);
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
