//! Tree difference streams.
//!
//! `dump_diff(since)` serializes every subtree whose root was modified
//! after view `since`, in preorder, pruning descent into subtrees that are
//! old enough to already exist on the receiving side. `apply_diff` grafts
//! such a stream onto a tree, sharing unchanged subtrees by hash.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use riptide_ids::Hash256;

use crate::node::{Node, NodeKind};
use crate::tree::Tree;
use crate::{Result, TreeError};

impl Tree {
    /// Serializes every subtree modified after view `since`.
    ///
    /// An up-to-date tree produces an empty stream.
    ///
    /// # Errors
    ///
    /// Propagates store read errors.
    pub fn dump_diff(&self, since: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        if let Some(root) = self.root_id() {
            self.dump_node(&root, since, &mut out)?;
        }
        Ok(out)
    }

    /// Applies a diff stream produced by [`Tree::dump_diff`].
    ///
    /// An empty diff is a valid no-op.
    ///
    /// # Errors
    ///
    /// Returns `TreeError::InvalidDiff` if the stream is malformed or
    /// references subtrees that are neither in the stream nor known locally.
    pub fn apply_diff(&mut self, diff: &[u8]) -> Result<()> {
        self.apply_diff_inner(diff, |_, _| {})
    }

    /// Applies a diff stream, invoking `notify` exactly once for every leaf
    /// reconstructed from the stream.
    ///
    /// # Errors
    ///
    /// Same as [`Tree::apply_diff`].
    pub fn apply_diff_with_callback<F>(&mut self, diff: &[u8], notify: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        self.apply_diff_inner(diff, notify)
    }

    fn dump_node(&self, id: &Hash256, since: u64, out: &mut Vec<u8>) -> Result<()> {
        let node = self.node(id)?;
        if node.view_id <= since {
            return Ok(());
        }

        out.extend_from_slice(&node.serialize());

        if node.kind == NodeKind::Inner {
            self.dump_node(&{ node.left }, since, out)?;
            self.dump_node(&{ node.right }, since, out)?;
        }
        Ok(())
    }

    fn apply_diff_inner<F>(&mut self, diff: &[u8], mut notify: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        if diff.is_empty() {
            return Ok(());
        }

        // Decode the preorder stream. The first node is the new root.
        let mut nodes = Vec::new();
        let mut by_id: HashMap<Hash256, Arc<Node>> = HashMap::new();
        let mut pos = 0usize;
        while pos < diff.len() {
            let (node, consumed) = Node::deserialize(&diff[pos..])?;
            pos += consumed;
            let node = Arc::new(node);
            by_id.insert(node.id, node.clone());
            nodes.push(node);
        }

        let new_root = nodes[0].clone();

        // Every subtree referenced from the stream must either be in the
        // stream itself or already resolvable locally.
        let mut visited: HashSet<Hash256> = HashSet::new();
        let mut stack = vec![new_root.id];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            match by_id.get(&id) {
                Some(node) => {
                    if node.kind == NodeKind::Inner {
                        stack.push(node.left);
                        stack.push(node.right);
                    }
                }
                None => {
                    if !self.has_node(&id)? {
                        return Err(TreeError::InvalidDiff(format!(
                            "diff references unknown subtree {}",
                            hex::encode(id)
                        )));
                    }
                }
            }
        }

        for node in &nodes {
            if node.is_leaf() {
                notify(&node.key, &node.value);
            }
        }

        let root_view = new_root.view_id;
        self.graft(nodes);
        self.set_root_id(Some(new_root.id));
        self.bump_view_id(root_view);

        Ok(())
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
    fn test_diff_update_notifier() {
        let mut tree1 = new_tree();
        let mut tree2 = new_tree();

        for (k, v) in [(b"a", b"b"), (b"c", b"d"), (b"m", b"n"), (b"p", b"q"), (b"r", b"s")] {
            tree1.insert(k, v).unwrap();
            tree2.insert(k, v).unwrap();
        }

        tree1.set_view_id(tree1.view_id() + 1);
        tree1.insert(b"e", b"f").unwrap();

        tree2.commit().unwrap();

        let mut updates = HashMap::new();
        let mut count = 0;
        tree2
            .apply_diff_with_callback(&tree1.dump_diff(tree2.view_id()).unwrap(), |k, v| {
                updates.insert(k.to_vec(), v.to_vec());
                count += 1;
            })
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[&b"e"[..]], b"f".to_vec());
        assert_eq!(tree2.checksum(), tree1.checksum());
    }

    #[test]
    fn test_apply_empty_diff() {
        let mut tree1 = new_tree();

        for _ in 0..50 {
            tree1.insert(b"a", b"b").unwrap();
            tree1.set_view_id(tree1.view_id() + 1);
        }
        tree1.insert(b"b", b"c").unwrap();
        tree1.set_view_id(tree1.view_id() + 1);
        for _ in 0..50 {
            tree1.insert(b"a", b"b").unwrap();
            tree1.set_view_id(tree1.view_id() + 1);
        }

        let mut tree2 = new_tree();
        tree2.insert(b"a", b"b").unwrap();
        tree2.set_view_id(tree2.view_id() + 1);

        tree1.commit().unwrap();
        tree2.commit().unwrap();

        tree2
            .apply_diff(&tree1.dump_diff(tree2.view_id()).unwrap())
            .unwrap();

        assert_eq!(tree2.checksum(), tree1.checksum());
    }

    #[test]
    fn test_empty_diff_is_noop() {
        let mut tree = new_tree();
        tree.insert(b"k", b"v").unwrap();
        let checksum = tree.checksum();

        tree.apply_diff(&[]).unwrap();

        assert_eq!(tree.checksum(), checksum);
        assert_eq!(tree.lookup(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_diff_converges_and_shrinks() {
        let mut tree = new_tree();
        tree.set_view_id(1);
        tree.insert(b"k1", b"1").unwrap();

        let mut tree2 = new_tree();
        tree2.set_view_id(0);
        tree2.commit().unwrap();

        tree2.apply_diff(&tree.dump_diff(0).unwrap()).unwrap();
        assert_eq!(tree2.view_id(), 1);

        tree2.set_view_id(2);
        tree2.insert(b"k2", b"2").unwrap();

        assert_eq!(tree2.lookup(b"k1").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree2.lookup(b"k2").unwrap(), Some(b"2".to_vec()));

        tree.commit().unwrap();
        tree.apply_diff(&tree2.dump_diff(1).unwrap()).unwrap();
        assert_eq!(tree.view_id(), 2);
        assert_eq!(tree.lookup(b"k2").unwrap(), Some(b"2".to_vec()));

        let len1 = tree.dump_diff(0).unwrap().len();
        let len2 = tree.dump_diff(1).unwrap().len();
        let len3 = tree.dump_diff(2).unwrap().len();

        assert_eq!(len3, 0);
        assert!(len1 > len2);
        assert!(len2 > len3);
    }

    #[test]
    fn test_diff_reapplication_reaches_committed_checksum() {
        // For any committed tree and any earlier view, applying the dump
        // since that view onto a replica holding the state at that view
        // reproduces the committed checksum.
        let mut tree1 = new_tree();
        let mut tree2 = new_tree();

        for round in 0u64..8 {
            tree1.set_view_id(round);
            for i in 0u64..16 {
                let key = [round.to_be_bytes(), i.to_be_bytes()].concat();
                tree1.insert(&key, &i.to_le_bytes()).unwrap();
            }
            tree1.commit().unwrap();

            if round == 0 {
                // tree2 replicates the view-0 state and then stalls.
                for i in 0u64..16 {
                    let key = [round.to_be_bytes(), i.to_be_bytes()].concat();
                    tree2.insert(&key, &i.to_le_bytes()).unwrap();
                }
                tree2.commit().unwrap();
            }
        }

        assert_ne!(tree2.checksum(), tree1.checksum());

        tree2.apply_diff(&tree1.dump_diff(0).unwrap()).unwrap();

        assert_eq!(tree2.checksum(), tree1.checksum());
        assert_eq!(tree2.len().unwrap(), tree1.len().unwrap());
        assert_eq!(tree2.view_id(), tree1.view_id());
    }

    #[test]
    fn test_malformed_diff_rejected() {
        let mut tree = new_tree();
        tree.insert(b"k", b"v").unwrap();

        let mut diff = tree.dump_diff(u64::MAX).unwrap();
        assert!(diff.is_empty());

        diff = new_tree_diff_with_garbage();
        assert!(matches!(
            tree.apply_diff(&diff),
            Err(TreeError::InvalidDiff(_))
        ));
    }

    fn new_tree_diff_with_garbage() -> Vec<u8> {
        let mut tree = new_tree();
        tree.set_view_id(1);
        tree.insert(b"a", b"1").unwrap();
        tree.insert(b"b", b"2").unwrap();

        let mut diff = tree.dump_diff(0).unwrap();
        diff.truncate(diff.len() - 3);
        diff
    }

    #[test]
    fn test_diff_with_dangling_reference_rejected() {
        let mut source = new_tree();
        source.set_view_id(2);
        for i in 0u64..8 {
            source.insert(&i.to_be_bytes(), b"v").unwrap();
        }

        // A diff since view 1 of a tree whose older subtrees were never
        // shared with us references nodes we cannot resolve.
        let mut aged = new_tree();
        aged.set_view_id(0);
        for i in 0u64..8 {
            aged.insert(&i.to_be_bytes(), b"v").unwrap();
        }
        aged.set_view_id(2);
        aged.insert(&99u64.to_be_bytes(), b"w").unwrap();

        let diff = aged.dump_diff(1).unwrap();
        assert!(!diff.is_empty());

        let mut fresh = new_tree();
        assert!(matches!(
            fresh.apply_diff(&diff),
            Err(TreeError::InvalidDiff(_))
        ));
    }
}
