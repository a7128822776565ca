//! The versioned Merkle AVL tree.

use std::collections::HashMap;
use std::sync::Arc;

use riptide_db::Store;
use riptide_ids::Hash256;

use crate::cache::NodeCache;
use crate::node::{Node, NodeKind};
use crate::{Result, TreeError, KEY_ROOT, KEY_VIEW_ID};

/// Default bound on the shared node cache, in entries.
const DEFAULT_CACHE_CAPACITY: usize = 2048;

/// A versioned Merkle AVL tree over a backing store.
///
/// The tree is copy-on-write: mutations replace the nodes along the path
/// from the root, so a [`Tree::snapshot`] keeps reading its frozen root
/// while the original keeps mutating. A tree is owned by one writer at a
/// time; snapshots support any number of concurrent readers.
///
/// Uncommitted nodes live in a per-instance dirty map; [`Tree::commit`]
/// flushes every dirty node reachable from the root into the store, keyed
/// by hash, and persists the root hash and view ID under well-known keys.
#[derive(Clone)]
pub struct Tree {
    store: Arc<dyn Store>,
    cache: Arc<NodeCache>,
    pending: HashMap<Hash256, Arc<Node>>,
    root: Option<Hash256>,
    view_id: u64,
}

impl Tree {
    /// Opens a tree over the given store, restoring the committed root hash
    /// and view ID if present.
    ///
    /// # Errors
    ///
    /// Propagates store read errors.
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        let root = match store.get(KEY_ROOT)? {
            Some(bytes) if bytes.len() == 32 && bytes != [0u8; 32] => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Some(hash)
            }
            _ => None,
        };

        let view_id = match store.get(KEY_VIEW_ID)? {
            Some(bytes) if bytes.len() == 8 => {
                u64::from_le_bytes(bytes.try_into().expect("length checked"))
            }
            _ => 0,
        };

        Ok(Self {
            store,
            cache: Arc::new(NodeCache::new(DEFAULT_CACHE_CAPACITY)),
            pending: HashMap::new(),
            root,
            view_id,
        })
    }

    /// Returns the tree's view ID.
    #[must_use]
    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    /// Sets the tree's view ID. Subsequent mutations stamp nodes with it.
    pub fn set_view_id(&mut self, view_id: u64) {
        self.view_id = view_id;
    }

    /// Returns the accounts checksum: the root node hash, or all zeroes for
    /// an empty tree.
    #[must_use]
    pub fn checksum(&self) -> Hash256 {
        self.root.unwrap_or([0u8; 32])
    }

    /// Returns the number of keys in the tree.
    ///
    /// # Errors
    ///
    /// Propagates store read errors.
    pub fn len(&self) -> Result<u64> {
        match self.root {
            Some(root) => Ok(self.node(&root)?.size),
            None => Ok(0),
        }
    }

    /// Returns true if the tree holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Takes a cheap snapshot sharing all node storage with this tree.
    #[must_use]
    pub fn snapshot(&self) -> Tree {
        self.clone()
    }

    /// Restores the tree to a previously taken snapshot.
    pub fn revert(&mut self, snapshot: &Tree) {
        *self = snapshot.clone();
    }

    /// Looks up the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Propagates store read errors; a missing key is `Ok(None)`.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(root) = self.root else {
            return Ok(None);
        };

        let mut current = self.node(&root)?;
        loop {
            match current.kind {
                NodeKind::Leaf => {
                    if current.key == key {
                        return Ok(Some(current.value.clone()));
                    }
                    return Ok(None);
                }
                NodeKind::Inner => {
                    let next = if key <= current.key.as_slice() {
                        current.left
                    } else {
                        current.right
                    };
                    current = self.node(&next)?;
                }
            }
        }
    }

    /// Inserts `value` under `key`, replacing any previous value.
    ///
    /// Every node rebuilt along the path is stamped with the tree's current
    /// view ID.
    ///
    /// # Errors
    ///
    /// Propagates store read errors.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let new_root = match self.root {
            Some(root) => {
                let root = self.node(&root)?;
                self.insert_at(root, key, value)?
            }
            None => self.add(Node::leaf(key.to_vec(), value.to_vec(), self.view_id)),
        };
        self.root = Some(new_root.id);
        Ok(())
    }

    /// Deletes the entry under `key`. Returns whether an entry was removed.
    ///
    /// # Errors
    ///
    /// Propagates store read errors.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let Some(root) = self.root else {
            return Ok(false);
        };

        let root = self.node(&root)?;
        let (replacement, removed) = self.delete_at(root, key)?;
        if removed {
            self.root = replacement.map(|node| node.id);
        }
        Ok(removed)
    }

    /// Flushes every dirty node reachable from the root to the store, then
    /// persists the root hash and view ID.
    ///
    /// # Errors
    ///
    /// Propagates store write errors.
    pub fn commit(&mut self) -> Result<()> {
        let mut batch = self.store.new_batch();
        let mut flushed = Vec::new();

        if let Some(root) = self.root {
            self.flush(&root, &mut *batch, &mut flushed);
        }

        batch.put(KEY_ROOT, &self.checksum());
        batch.put(KEY_VIEW_ID, &self.view_id.to_le_bytes());
        batch.write()?;

        for id in flushed {
            if let Some(node) = self.pending.remove(&id) {
                self.cache.put(node);
            }
        }
        // Anything left over was superseded before commit and is unreachable.
        self.pending.clear();

        Ok(())
    }

    /// Visits every `(key, value)` pair in lexicographic key order.
    ///
    /// # Errors
    ///
    /// Propagates store read errors.
    pub fn iterate<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        if let Some(root) = self.root {
            self.walk(&root, &mut f)?;
        }
        Ok(())
    }

    /// Visits every pair with key `>= start` in order, until the callback
    /// returns `false`.
    ///
    /// # Errors
    ///
    /// Propagates store read errors.
    pub fn iterate_from<F>(&self, start: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        if let Some(root) = self.root {
            self.walk_from(&root, start, &mut f)?;
        }
        Ok(())
    }

    /// Visits every pair whose key starts with `prefix`, in order.
    ///
    /// # Errors
    ///
    /// Propagates store read errors.
    pub fn iterate_prefix<F>(&self, prefix: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        self.iterate_from(prefix, |key, value| {
            if key.starts_with(prefix) {
                f(key, value);
                true
            } else {
                false
            }
        })
    }

    // ---- internal ----

    pub(crate) fn root_id(&self) -> Option<Hash256> {
        self.root
    }

    pub(crate) fn set_root_id(&mut self, root: Option<Hash256>) {
        self.root = root;
    }

    pub(crate) fn bump_view_id(&mut self, view_id: u64) {
        self.view_id = self.view_id.max(view_id);
    }

    pub(crate) fn graft(&mut self, nodes: impl IntoIterator<Item = Arc<Node>>) {
        for node in nodes {
            self.pending.insert(node.id, node);
        }
    }

    /// Resolves a node by hash: dirty map, then cache, then store.
    pub(crate) fn node(&self, id: &Hash256) -> Result<Arc<Node>> {
        if let Some(node) = self.pending.get(id) {
            return Ok(node.clone());
        }
        if let Some(node) = self.cache.load(id) {
            return Ok(node);
        }

        let bytes = self
            .store
            .get(id)?
            .ok_or_else(|| TreeError::MissingNode(hex::encode(id)))?;
        let (node, consumed) = Node::deserialize(&bytes)?;
        if consumed != bytes.len() {
            return Err(TreeError::MissingNode(hex::encode(id)));
        }

        let node = Arc::new(node);
        self.cache.put(node.clone());
        Ok(node)
    }

    /// Returns whether a node is resolvable without deserializing it.
    pub(crate) fn has_node(&self, id: &Hash256) -> Result<bool> {
        if self.pending.contains_key(id) || self.cache.load(id).is_some() {
            return Ok(true);
        }
        Ok(self.store.has(id)?)
    }

    fn add(&mut self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        self.pending.insert(node.id, node.clone());
        node
    }

    fn insert_at(&mut self, node: Arc<Node>, key: &[u8], value: &[u8]) -> Result<Arc<Node>> {
        match node.kind {
            NodeKind::Leaf => {
                if node.key == key {
                    return Ok(self.add(Node::leaf(
                        key.to_vec(),
                        value.to_vec(),
                        self.view_id,
                    )));
                }

                let fresh = self.add(Node::leaf(key.to_vec(), value.to_vec(), self.view_id));
                let (separator, left, right) = if key < node.key.as_slice() {
                    (key.to_vec(), fresh, node)
                } else {
                    (node.key.clone(), node, fresh)
                };
                Ok(self.add(Node::inner(separator, &left, &right, self.view_id)))
            }
            NodeKind::Inner => {
                let rebuilt = if key <= node.key.as_slice() {
                    let left = self.node(&node.left)?;
                    let right = self.node(&node.right)?;
                    let left = self.insert_at(left, key, value)?;
                    self.add(Node::inner(node.key.clone(), &left, &right, self.view_id))
                } else {
                    let left = self.node(&node.left)?;
                    let right = self.node(&node.right)?;
                    let right = self.insert_at(right, key, value)?;
                    self.add(Node::inner(node.key.clone(), &left, &right, self.view_id))
                };
                self.rebalance(rebuilt)
            }
        }
    }

    fn delete_at(&mut self, node: Arc<Node>, key: &[u8]) -> Result<(Option<Arc<Node>>, bool)> {
        match node.kind {
            NodeKind::Leaf => {
                if node.key == key {
                    Ok((None, true))
                } else {
                    Ok((Some(node), false))
                }
            }
            NodeKind::Inner => {
                let left = self.node(&node.left)?;
                let right = self.node(&node.right)?;

                let (rebuilt, removed) = if key <= node.key.as_slice() {
                    let (replacement, removed) = self.delete_at(left, key)?;
                    if !removed {
                        return Ok((Some(node), false));
                    }
                    match replacement {
                        // Left subtree vanished; promote the sibling.
                        None => return Ok((Some(right), true)),
                        Some(left) => (
                            self.add(Node::inner(node.key.clone(), &left, &right, self.view_id)),
                            true,
                        ),
                    }
                } else {
                    let (replacement, removed) = self.delete_at(right, key)?;
                    if !removed {
                        return Ok((Some(node), false));
                    }
                    match replacement {
                        None => return Ok((Some(left), true)),
                        Some(right) => (
                            self.add(Node::inner(node.key.clone(), &left, &right, self.view_id)),
                            true,
                        ),
                    }
                };

                let balanced = self.rebalance(rebuilt)?;
                Ok((Some(balanced), removed))
            }
        }
    }

    /// Standard AVL rebalancing over an inner node whose children may have
    /// drifted out of balance by one rotation's worth.
    fn rebalance(&mut self, node: Arc<Node>) -> Result<Arc<Node>> {
        debug_assert_eq!(node.kind, NodeKind::Inner);

        let left = self.node(&node.left)?;
        let right = self.node(&node.right)?;
        let balance = left.height as i64 - right.height as i64;

        if balance > 1 {
            let left_left = self.node(&left.left)?;
            let left_right = self.node(&left.right)?;
            let left = if left_left.height >= left_right.height {
                left
            } else {
                self.rotate_left(&left)?
            };
            let node = self.add(Node::inner(node.key.clone(), &left, &right, self.view_id));
            self.rotate_right(&node)
        } else if balance < -1 {
            let right_left = self.node(&right.left)?;
            let right_right = self.node(&right.right)?;
            let right = if right_right.height >= right_left.height {
                right
            } else {
                self.rotate_right(&right)?
            };
            let node = self.add(Node::inner(node.key.clone(), &left, &right, self.view_id));
            self.rotate_left(&node)
        } else {
            Ok(node)
        }
    }

    fn rotate_left(&mut self, node: &Node) -> Result<Arc<Node>> {
        let pivot = self.node(&node.right)?;
        let left = self.node(&node.left)?;
        let pivot_left = self.node(&pivot.left)?;
        let pivot_right = self.node(&pivot.right)?;

        let lowered = self.add(Node::inner(
            node.key.clone(),
            &left,
            &pivot_left,
            self.view_id,
        ));
        Ok(self.add(Node::inner(
            pivot.key.clone(),
            &lowered,
            &pivot_right,
            self.view_id,
        )))
    }

    fn rotate_right(&mut self, node: &Node) -> Result<Arc<Node>> {
        let pivot = self.node(&node.left)?;
        let right = self.node(&node.right)?;
        let pivot_left = self.node(&pivot.left)?;
        let pivot_right = self.node(&pivot.right)?;

        let lowered = self.add(Node::inner(
            node.key.clone(),
            &pivot_right,
            &right,
            self.view_id,
        ));
        Ok(self.add(Node::inner(
            pivot.key.clone(),
            &pivot_left,
            &lowered,
            self.view_id,
        )))
    }

    fn flush(&self, id: &Hash256, batch: &mut dyn riptide_db::Batch, flushed: &mut Vec<Hash256>) {
        let Some(node) = self.pending.get(id) else {
            // Already persisted; by construction so is its whole subtree.
            return;
        };

        batch.put(id, &node.serialize());
        flushed.push(*id);

        if node.kind == NodeKind::Inner {
            self.flush(&node.left.clone(), batch, flushed);
            self.flush(&node.right.clone(), batch, flushed);
        }
    }

    fn walk<F>(&self, id: &Hash256, f: &mut F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        let node = self.node(id)?;
        match node.kind {
            NodeKind::Leaf => {
                f(&node.key, &node.value);
                Ok(())
            }
            NodeKind::Inner => {
                self.walk(&node.left, f)?;
                self.walk(&node.right, f)
            }
        }
    }

    fn walk_from<F>(&self, id: &Hash256, start: &[u8], f: &mut F) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let node = self.node(id)?;
        match node.kind {
            NodeKind::Leaf => {
                if node.key.as_slice() >= start {
                    return Ok(f(&node.key, &node.value));
                }
                Ok(true)
            }
            NodeKind::Inner => {
                if start <= node.key.as_slice() && !self.walk_from(&node.left, start, f)? {
                    return Ok(false);
                }
                self.walk_from(&node.right, start, f)
            }
        }
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root.map(hex::encode))
            .field("view_id", &self.view_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_db::MemStore;

    fn new_tree() -> Tree {
        Tree::new(Arc::new(MemStore::new())).unwrap()
    }

    #[test]
    fn test_insert_lookup() {
        let mut tree = new_tree();

        tree.insert(b"key", b"value").unwrap();
        tree.insert(b"foo", b"bar").unwrap();

        assert_eq!(tree.lookup(b"key").unwrap(), Some(b"value".to_vec()));
        assert_eq!(tree.lookup(b"foo").unwrap(), Some(b"bar".to_vec()));
        assert_eq!(tree.lookup(b"missing").unwrap(), None);
        assert_eq!(tree.len().unwrap(), 2);
    }

    #[test]
    fn test_insert_replaces() {
        let mut tree = new_tree();

        tree.insert(b"key", b"old").unwrap();
        tree.insert(b"key", b"new").unwrap();

        assert_eq!(tree.lookup(b"key").unwrap(), Some(b"new".to_vec()));
        assert_eq!(tree.len().unwrap(), 1);
    }

    #[test]
    fn test_commit_persists() {
        let store = Arc::new(MemStore::new());

        {
            let mut tree = Tree::new(store.clone()).unwrap();
            tree.insert(b"key", b"value").unwrap();
            tree.commit().unwrap();
        }

        {
            let tree = Tree::new(store).unwrap();
            assert_eq!(tree.lookup(b"key").unwrap(), Some(b"value".to_vec()));
        }
    }

    #[test]
    fn test_delete_across_commits() {
        let store = Arc::new(MemStore::new());

        {
            let mut tree = Tree::new(store.clone()).unwrap();
            tree.insert(b"key", b"value").unwrap();
            tree.insert(b"foo", b"bar").unwrap();
            tree.commit().unwrap();
        }

        {
            let mut tree = Tree::new(store.clone()).unwrap();
            assert!(tree.delete(b"foo").unwrap());
            tree.commit().unwrap();
        }

        {
            let tree = Tree::new(store).unwrap();
            assert_eq!(tree.lookup(b"key").unwrap(), Some(b"value".to_vec()));
            assert_eq!(tree.lookup(b"foo").unwrap(), None);
        }
    }

    #[test]
    fn test_delete_until_empty() {
        let store = Arc::new(MemStore::new());
        let keys: &[&[u8]] = &[b"key", b"foo", b"lorem"];

        {
            let mut tree = Tree::new(store.clone()).unwrap();
            for key in keys {
                tree.insert(key, b"value").unwrap();
            }
            tree.commit().unwrap();
        }

        {
            let mut tree = Tree::new(store.clone()).unwrap();
            for key in keys {
                assert!(tree.delete(key).unwrap());
            }
            for key in keys {
                assert_eq!(tree.lookup(key).unwrap(), None);
            }
            assert!(tree.is_empty());
            assert_eq!(tree.checksum(), [0u8; 32]);
            tree.commit().unwrap();
        }

        {
            let tree = Tree::new(store).unwrap();
            for key in keys {
                assert_eq!(tree.lookup(key).unwrap(), None);
            }
        }
    }

    #[test]
    fn test_snapshot_revert() {
        let mut tree = new_tree();
        tree.insert(b"k1", b"1").unwrap();
        tree.commit().unwrap();

        let checksum = tree.checksum();
        let snapshot = tree.snapshot();

        tree.insert(b"k1", b"2").unwrap();
        tree.insert(b"k2", b"2").unwrap();
        assert_ne!(tree.checksum(), checksum);

        tree.revert(&snapshot);

        assert_eq!(tree.checksum(), checksum);
        assert_eq!(tree.lookup(b"k1").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.lookup(b"k2").unwrap(), None);
    }

    #[test]
    fn test_insert_then_delete_restores_checksum() {
        let mut tree = new_tree();
        for key in [&b"b"[..], b"d", b"f", b"h"] {
            tree.insert(key, b"v").unwrap();
        }
        let checksum = tree.checksum();

        tree.insert(b"e", b"v").unwrap();
        assert_ne!(tree.checksum(), checksum);

        assert!(tree.delete(b"e").unwrap());
        assert_eq!(tree.lookup(b"e").unwrap(), None);
        assert_eq!(tree.checksum(), checksum);
    }

    #[test]
    fn test_balance_under_sequential_inserts() {
        let mut tree = new_tree();
        for i in 0u64..256 {
            tree.insert(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
        }

        let root = tree.node(&tree.root_id().unwrap()).unwrap();
        assert_eq!(root.size, 256);
        // A balanced tree over 256 leaves stays within the AVL height bound
        // of ~1.44 log2(n).
        assert!(root.height <= 12, "height {} too tall", root.height);

        for i in 0u64..256 {
            assert_eq!(
                tree.lookup(&i.to_be_bytes()).unwrap(),
                Some(i.to_le_bytes().to_vec())
            );
        }
    }

    #[test]
    fn test_iterate_in_key_order() {
        let mut tree = new_tree();
        for i in 0u64..50 {
            tree.insert(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
        }
        tree.commit().unwrap();

        let mut result = Vec::new();
        tree.iterate(|key, value| {
            assert_eq!(key, value);
            result.push(u64::from_be_bytes(key.try_into().unwrap()));
        })
        .unwrap();

        assert_eq!(result, (0u64..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_iterate_from() {
        let mut tree = new_tree();
        for i in 0u64..50 {
            tree.insert(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
        }
        tree.commit().unwrap();

        // Early stop at 42.
        let mut result = Vec::new();
        tree.iterate_from(&20u64.to_be_bytes(), |key, _| {
            let k = u64::from_be_bytes(key.try_into().unwrap());
            result.push(k);
            k != 42
        })
        .unwrap();
        assert_eq!(result, (20u64..=42).collect::<Vec<_>>());

        // Full iteration from 20.
        let mut result = Vec::new();
        tree.iterate_from(&20u64.to_be_bytes(), |key, _| {
            result.push(u64::from_be_bytes(key.try_into().unwrap()));
            true
        })
        .unwrap();
        assert_eq!(result, (20u64..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_iterate_prefix() {
        let mut tree = new_tree();

        let values = [
            "1", "foo:2", "foo:3", "4", "foo:5", "6", "foo:7", "8", "9", "10", "foo:11",
        ];
        for value in values {
            tree.insert(value.as_bytes(), value.as_bytes()).unwrap();
        }
        tree.commit().unwrap();

        let mut result = Vec::new();
        tree.iterate_prefix(b"foo:", |key, _| {
            result.push(String::from_utf8(key.to_vec()).unwrap());
        })
        .unwrap();

        assert_eq!(result, vec!["foo:11", "foo:2", "foo:3", "foo:5", "foo:7"]);
    }

    #[test]
    fn test_view_id_persists() {
        let store = Arc::new(MemStore::new());

        {
            let mut tree = Tree::new(store.clone()).unwrap();
            tree.set_view_id(42);
            tree.insert(b"k", b"v").unwrap();
            tree.commit().unwrap();
        }

        {
            let tree = Tree::new(store).unwrap();
            assert_eq!(tree.view_id(), 42);
        }
    }
}
