//! The view-graph: a rooted DAG of admitted transactions.
//!
//! Exactly one root exists at any instant; every other admitted transaction
//! reaches it backward through parent pointers. Admission enforces:
//!
//! - every parent of an admitted transaction is already admitted or the root
//! - the timestamp is strictly greater than the maximum parent timestamp
//! - the view ID equals the current root's view
//! - parent IDs are sorted and duplicate-free
//! - no admitted transaction sits below the root's depth

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use riptide_ids::TransactionId;

use crate::tx::{compute_difficulty, Transaction};
use crate::{Config, LedgerError, Result};

struct GraphInner {
    transactions: HashMap<TransactionId, Arc<Transaction>>,
    /// Depths are derived, not serialized; the root rebases to zero.
    depths: HashMap<TransactionId, u64>,
    /// Number of admitted children per transaction; leaves have none.
    children: HashMap<TransactionId, usize>,
    /// Parents referenced by admitted transactions but never seen.
    missing: HashSet<TransactionId>,
    root: Arc<Transaction>,
    height: u64,
}

/// The in-memory DAG of transactions for the current consensus round.
///
/// A single mutex guards the transaction map; none of the operations here
/// suspend while holding it.
pub struct Graph {
    inner: Mutex<GraphInner>,
    max_eligible_parents_depth_diff: u64,
    difficulty: parking_lot::RwLock<u64>,
    config: Config,
}

impl Graph {
    /// Creates a graph rooted at the given transaction.
    #[must_use]
    pub fn new(root: Arc<Transaction>, config: &Config) -> Self {
        let difficulty = compute_difficulty(&root, config);

        let mut transactions = HashMap::new();
        transactions.insert(root.id, root.clone());

        let mut depths = HashMap::new();
        depths.insert(root.id, 0);

        Self {
            inner: Mutex::new(GraphInner {
                transactions,
                depths,
                children: HashMap::new(),
                missing: HashSet::new(),
                root,
                height: 1,
            }),
            max_eligible_parents_depth_diff: config.max_eligible_parents_depth_diff,
            difficulty: parking_lot::RwLock::new(difficulty),
            config: config.clone(),
        }
    }

    /// The current root transaction.
    #[must_use]
    pub fn root(&self) -> Arc<Transaction> {
        self.inner.lock().root.clone()
    }

    /// The view ID new transactions attach in: one past the root's view.
    #[must_use]
    pub fn view_id(&self) -> u64 {
        self.inner.lock().root.view_id + 1
    }

    /// Current critical-transaction difficulty, derived from the root.
    #[must_use]
    pub fn difficulty(&self) -> u64 {
        *self.difficulty.read()
    }

    /// One past the maximum admitted depth.
    #[must_use]
    pub fn height(&self) -> u64 {
        self.inner.lock().height
    }

    /// Depth of the root, always zero after a reset.
    #[must_use]
    pub fn root_depth(&self) -> u64 {
        let inner = self.inner.lock();
        inner.depths.get(&inner.root.id).copied().unwrap_or(0)
    }

    /// Number of admitted transactions with depth in `[from, to)`.
    #[must_use]
    pub fn depth_len(&self, from: u64, to: u64) -> usize {
        let inner = self.inner.lock();
        inner
            .depths
            .values()
            .filter(|depth| (from..to).contains(*depth))
            .count()
    }

    /// Number of parents referenced by admitted transactions that have
    /// never been seen.
    #[must_use]
    pub fn missing_len(&self) -> usize {
        self.inner.lock().missing.len()
    }

    /// Number of admitted transactions, the root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().transactions.len()
    }

    /// True when only the root is admitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Looks up an admitted transaction by ID.
    #[must_use]
    pub fn lookup(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.inner.lock().transactions.get(id).cloned()
    }

    /// IDs of every admitted transaction, the root included.
    #[must_use]
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.inner.lock().transactions.keys().copied().collect()
    }

    /// Depth of an admitted transaction.
    #[must_use]
    pub fn depth(&self, id: &TransactionId) -> Option<u64> {
        self.inner.lock().depths.get(id).copied()
    }

    /// Admits a transaction. Idempotent: re-admission of a known ID yields
    /// `AlreadyPresent` and leaves the graph unchanged.
    ///
    /// # Errors
    ///
    /// - `AlreadyPresent` on a duplicate
    /// - `MissingParents` when any parent is unknown
    /// - `InvalidAncestry` when timestamps or depth break the invariants
    pub fn add_transaction(&self, tx: Transaction) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.transactions.contains_key(&tx.id) {
            return Err(LedgerError::AlreadyPresent(tx.id));
        }

        let missing: Vec<TransactionId> = tx
            .parents
            .iter()
            .filter(|parent| !inner.transactions.contains_key(*parent))
            .copied()
            .collect();
        if !missing.is_empty() {
            for parent in &missing {
                inner.missing.insert(*parent);
            }
            return Err(LedgerError::MissingParents(missing));
        }

        let mut max_parent_depth = 0u64;
        for parent_id in &tx.parents {
            let parent = &inner.transactions[parent_id];
            if tx.timestamp <= parent.timestamp {
                return Err(LedgerError::InvalidAncestry(format!(
                    "timestamp {} does not exceed parent timestamp {}",
                    tx.timestamp, parent.timestamp
                )));
            }
            max_parent_depth = max_parent_depth.max(inner.depths[parent_id]);
        }

        let depth = max_parent_depth + 1;

        let id = tx.id;
        for parent_id in tx.parents.clone() {
            *inner.children.entry(parent_id).or_insert(0) += 1;
        }
        inner.missing.remove(&id);
        inner.transactions.insert(id, Arc::new(tx));
        inner.depths.insert(id, depth);
        inner.height = inner.height.max(depth + 1);

        Ok(())
    }

    /// Checks that the transaction's view ID matches the current round.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidTransaction` on a view mismatch.
    pub fn assert_in_view(&self, tx: &Transaction) -> Result<()> {
        let expected = self.view_id();
        if tx.view_id != expected {
            return Err(LedgerError::InvalidTransaction(format!(
                "transaction view ID {} does not match the current view {expected}",
                tx.view_id
            )));
        }
        Ok(())
    }

    /// Checks parents, timestamps and depth eligibility ahead of admission.
    ///
    /// # Errors
    ///
    /// - `MissingParents` when any parent is unknown
    /// - `InvalidAncestry` when timestamps or the depth window are violated
    pub fn assert_valid_ancestry(&self, tx: &Transaction) -> Result<()> {
        let inner = self.inner.lock();

        if tx.parents.is_empty() {
            return Err(LedgerError::InvalidAncestry(
                "transaction names no parents".to_string(),
            ));
        }

        let missing: Vec<TransactionId> = tx
            .parents
            .iter()
            .filter(|parent| !inner.transactions.contains_key(*parent))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(LedgerError::MissingParents(missing));
        }

        let mut max_parent_depth = 0u64;
        for parent_id in &tx.parents {
            let parent = &inner.transactions[parent_id];
            if tx.timestamp <= parent.timestamp {
                return Err(LedgerError::InvalidAncestry(format!(
                    "timestamp {} does not exceed parent timestamp {}",
                    tx.timestamp, parent.timestamp
                )));
            }
            max_parent_depth = max_parent_depth.max(inner.depths[parent_id]);
        }

        let depth = max_parent_depth + 1;
        let root_depth = inner.depths[&inner.root.id];
        if depth > root_depth + self.max_eligible_parents_depth_diff + 1 {
            return Err(LedgerError::InvalidAncestry(format!(
                "depth {depth} exceeds the eligible window above the root"
            )));
        }

        Ok(())
    }

    /// Leaves of the DAG whose depth is within the eligibility window of
    /// the current height, sorted by ID so signing is deterministic.
    #[must_use]
    pub fn find_eligible_parents(&self) -> Vec<TransactionId> {
        let inner = self.inner.lock();
        let root_depth = inner.depths[&inner.root.id];

        let mut eligible: Vec<TransactionId> = inner
            .transactions
            .keys()
            .filter(|id| inner.children.get(*id).copied().unwrap_or(0) == 0)
            .filter(|id| {
                let depth = inner.depths[*id];
                depth >= root_depth
                    && depth + self.max_eligible_parents_depth_diff >= inner.height.saturating_sub(1)
            })
            .copied()
            .collect();

        eligible.sort_unstable();
        eligible
    }

    /// Resets the graph onto a new root. Everything outside the new root is
    /// dropped and not retained for replay; depth counters rebase to zero.
    pub fn reset(&self, new_root: Arc<Transaction>) {
        let mut inner = self.inner.lock();

        inner.transactions.clear();
        inner.depths.clear();
        inner.children.clear();
        inner.missing.clear();

        inner.transactions.insert(new_root.id, new_root.clone());
        inner.depths.insert(new_root.id, 0);
        inner.height = 1;
        inner.root = new_root.clone();

        *self.difficulty.write() = compute_difficulty(&new_root, &self.config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::Tag;
    use crate::Config;
    use riptide_crypto::Keypair;

    fn keys() -> Keypair {
        Keypair::from_secret_bytes([3u8; 32])
    }

    fn root_tx() -> Transaction {
        let mut tx = Transaction::new(&keys(), Tag::Nop, Vec::new());
        tx.timestamp = 1_000;
        tx.rehash();
        tx
    }

    fn child_of(graph: &Graph, parents: &[&Transaction], timestamp: u64) -> Transaction {
        let mut tx = Transaction::new(&keys(), Tag::Nop, Vec::new());
        tx.sender = keys().account();
        tx.parents = parents.iter().map(|parent| parent.id).collect();
        tx.parents.sort_unstable();
        tx.timestamp = timestamp;
        tx.view_id = graph.view_id();
        tx.rehash();
        tx
    }

    #[test]
    fn test_add_and_lookup() {
        let config = Config::default();
        let root = Arc::new(root_tx());
        let graph = Graph::new(root.clone(), &config);

        let tx = child_of(&graph, &[&root], 2_000);
        let id = tx.id;

        graph.add_transaction(tx).unwrap();

        assert!(graph.lookup(&id).is_some());
        assert_eq!(graph.depth(&id), Some(1));
        assert_eq!(graph.height(), 2);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_readmission_is_idempotent() {
        let config = Config::default();
        let root = Arc::new(root_tx());
        let graph = Graph::new(root.clone(), &config);

        let tx = child_of(&graph, &[&root], 2_000);
        graph.add_transaction(tx.clone()).unwrap();

        let before = graph.len();
        assert!(matches!(
            graph.add_transaction(tx),
            Err(LedgerError::AlreadyPresent(_))
        ));
        assert_eq!(graph.len(), before);
    }

    #[test]
    fn test_missing_parents() {
        let config = Config::default();
        let root = Arc::new(root_tx());
        let graph = Graph::new(root.clone(), &config);

        let phantom = child_of(&graph, &[&root], 2_000);
        let orphan = child_of(&graph, &[&phantom], 3_000);

        assert!(matches!(
            graph.add_transaction(orphan),
            Err(LedgerError::MissingParents(ids)) if ids == vec![phantom.id]
        ));
        assert_eq!(graph.missing_len(), 1);
    }

    #[test]
    fn test_timestamp_must_exceed_parents() {
        let config = Config::default();
        let root = Arc::new(root_tx());
        let graph = Graph::new(root.clone(), &config);

        let stale = child_of(&graph, &[&root], root.timestamp);
        assert!(matches!(
            graph.add_transaction(stale),
            Err(LedgerError::InvalidAncestry(_))
        ));
    }

    #[test]
    fn test_eligible_parents_start_at_root() {
        let config = Config::default();
        let root = Arc::new(root_tx());
        let graph = Graph::new(root.clone(), &config);

        assert_eq!(graph.find_eligible_parents(), vec![root.id]);
    }

    #[test]
    fn test_eligible_parents_are_sorted_leaves() {
        let config = Config::default();
        let root = Arc::new(root_tx());
        let graph = Graph::new(root.clone(), &config);

        let a = child_of(&graph, &[&root], 2_000);
        let b = child_of(&graph, &[&root], 2_001);
        graph.add_transaction(a.clone()).unwrap();
        graph.add_transaction(b.clone()).unwrap();

        let mut expected = vec![a.id, b.id];
        expected.sort_unstable();
        assert_eq!(graph.find_eligible_parents(), expected);
    }

    #[test]
    fn test_shallow_leaves_fall_out_of_eligibility() {
        let mut config = Config::default();
        config.max_eligible_parents_depth_diff = 2;

        let root = Arc::new(root_tx());
        let graph = Graph::new(root.clone(), &config);

        // A leaf stuck at depth 1 while a chain grows past the window.
        let stuck = child_of(&graph, &[&root], 2_000);
        graph.add_transaction(stuck.clone()).unwrap();

        let mut tip = child_of(&graph, &[&root], 2_001);
        graph.add_transaction(tip.clone()).unwrap();
        for i in 0..4u64 {
            let next = child_of(&graph, &[&tip], 3_000 + i);
            graph.add_transaction(next.clone()).unwrap();
            tip = next;
        }

        // Both are leaves, but only the deep tip is within the window.
        let eligible = graph.find_eligible_parents();
        assert!(eligible.contains(&tip.id));
        assert!(!eligible.contains(&stuck.id));
    }

    #[test]
    fn test_reset_drops_everything_but_new_root() {
        let config = Config::default();
        let root = Arc::new(root_tx());
        let graph = Graph::new(root.clone(), &config);

        let a = child_of(&graph, &[&root], 2_000);
        let b = child_of(&graph, &[&a], 3_000);
        graph.add_transaction(a.clone()).unwrap();
        graph.add_transaction(b.clone()).unwrap();

        let mut new_root = b.clone();
        new_root.view_id = graph.view_id();
        new_root.rehash();

        graph.reset(Arc::new(new_root.clone()));

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.root().id, new_root.id);
        assert_eq!(graph.root_depth(), 0);
        assert_eq!(graph.height(), 1);
        assert_eq!(graph.view_id(), new_root.view_id + 1);
        assert!(graph.lookup(&a.id).is_none());
    }

    #[test]
    fn test_assert_in_view() {
        let config = Config::default();
        let root = Arc::new(root_tx());
        let graph = Graph::new(root.clone(), &config);

        let mut tx = child_of(&graph, &[&root], 2_000);
        graph.assert_in_view(&tx).unwrap();

        tx.view_id += 1;
        assert!(graph.assert_in_view(&tx).is_err());
    }
}
