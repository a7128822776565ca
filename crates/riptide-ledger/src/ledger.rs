//! The ledger: one owned value threading every core component together.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use riptide_avl::Tree;
use riptide_crypto::Keypair;
use riptide_db::Store;
use riptide_ids::{AccountId, Hash256, TransactionId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accounts::Accounts;
use crate::events::Channels;
use crate::graph::Graph;
use crate::processor::Processors;
use crate::reward::reward_validators;
use crate::snowball::Snowball;
use crate::timestamp::now_ms;
use crate::tx::{critical_timestamp_window_size, Tag, Transaction};
use crate::{Config, LedgerError, Result};

/// Store key holding the marshaled root transaction.
const KEY_ROOT_TX: &[u8] = b"ledger_root";

/// Store key prefix for per-transaction audit records.
const KEY_DELTAS: &[u8] = b"deltas_";

/// The ledger core.
///
/// All shared handles are threaded through this single value; the state
/// machine in [`crate::machine`] runs against an `Arc<Ledger>`.
pub struct Ledger {
    pub(crate) keys: Keypair,
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn Store>,

    pub(crate) graph: Graph,
    pub(crate) accounts: Accounts,

    /// Round consensus: converges on the critical transaction ending the
    /// current round.
    pub(crate) round: Snowball<Transaction>,
    /// Sync-target consensus: converges on the network's root during
    /// out-of-sync detection.
    pub(crate) sync: Snowball<Transaction>,

    pub(crate) processors: RwLock<Processors>,
    pub(crate) channels: Channels,

    pub(crate) chunk_cache: Mutex<LruCache<Hash256, Vec<u8>>>,

    pub(crate) kill: CancellationToken,
}

impl Ledger {
    /// Opens or creates a ledger over the given store.
    ///
    /// A fresh store goes through inception: genesis allocations are
    /// written and committed, and a deterministic root transaction
    /// committing to that state becomes the base of the view-graph.
    ///
    /// # Errors
    ///
    /// Propagates store errors and configuration validation failures.
    pub fn new(keys: Keypair, store: Arc<dyn Store>, config: Config) -> Result<Arc<Self>> {
        config.validate().map_err(LedgerError::InvalidConfig)?;

        let accounts = Accounts::new(store.clone())?;

        let root = match store.get(KEY_ROOT_TX)? {
            Some(bytes) => Transaction::unmarshal(&bytes)?,
            None => {
                let root = perform_inception(&accounts, &config)?;
                store.put(KEY_ROOT_TX, &root.marshal())?;
                root
            }
        };

        let graph = Graph::new(Arc::new(root), &config);

        Ok(Arc::new(Self {
            round: Snowball::new(config.query),
            sync: Snowball::new(config.sync),
            processors: RwLock::new(Processors::builtin()),
            channels: Channels::new(),
            chunk_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.chunk_cache_entries.max(1)).expect("bounded below by one"),
            )),
            kill: CancellationToken::new(),
            keys,
            store,
            graph,
            accounts,
            config,
        }))
    }

    /// The node's own account.
    #[must_use]
    pub fn account(&self) -> AccountId {
        self.keys.account()
    }

    /// The ledger configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The event channels shared with the transport collaborator.
    #[must_use]
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// The process-wide cancellation token. Cancelling it stops every
    /// worker at its next suspension point.
    #[must_use]
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Requests shutdown of the state machine.
    pub fn shutdown(&self) {
        self.kill.cancel();
    }

    /// The view ID transactions currently attach in.
    #[must_use]
    pub fn view_id(&self) -> u64 {
        self.graph.view_id()
    }

    /// The current critical-transaction difficulty.
    #[must_use]
    pub fn difficulty(&self) -> u64 {
        self.graph.difficulty()
    }

    /// The current root transaction.
    #[must_use]
    pub fn root(&self) -> Arc<Transaction> {
        self.graph.root()
    }

    /// The view-graph height.
    #[must_use]
    pub fn height(&self) -> u64 {
        self.graph.height()
    }

    /// A snapshot of the committed account state.
    #[must_use]
    pub fn snapshot(&self) -> Tree {
        self.accounts.snapshot()
    }

    /// The committed accounts checksum.
    #[must_use]
    pub fn checksum(&self) -> Hash256 {
        self.accounts.checksum()
    }

    /// Looks up an admitted transaction.
    #[must_use]
    pub fn find_transaction(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.graph.lookup(id)
    }

    /// Lists admitted transactions ordered by depth, optionally filtered by
    /// sender or creator, with offset/limit pagination.
    #[must_use]
    pub fn list_transactions(
        &self,
        offset: usize,
        limit: usize,
        sender: Option<AccountId>,
        creator: Option<AccountId>,
    ) -> Vec<Arc<Transaction>> {
        let mut transactions: Vec<(u64, Arc<Transaction>)> = Vec::new();

        for id in self.graph.transaction_ids() {
            let Some(tx) = self.graph.lookup(&id) else {
                continue;
            };
            let keep = match (&sender, &creator) {
                (None, None) => true,
                (Some(sender), _) if tx.sender == *sender => true,
                (_, Some(creator)) if tx.creator == *creator => true,
                _ => false,
            };
            if keep {
                let depth = self.graph.depth(&id).unwrap_or(0);
                transactions.push((depth, tx));
            }
        }

        transactions.sort_by_key(|(depth, tx)| (*depth, tx.id));

        let mut result: Vec<Arc<Transaction>> =
            transactions.into_iter().map(|(_, tx)| tx).collect();

        if offset != 0 || limit != 0 {
            if offset >= result.len() {
                return Vec::new();
            }
            result = result.split_off(offset);
            if limit != 0 && limit < result.len() {
                result.truncate(limit);
            }
        }

        result
    }

    /// Registers a transaction processor, replacing the built-in for that
    /// tag.
    pub fn register_processor<F>(&self, tag: Tag, processor: F)
    where
        F: Fn(&mut Tree, &Transaction) -> Result<()> + Send + Sync + 'static,
    {
        self.processors.write().register(tag, processor);
    }

    /// Fills in sender data: eligible parents, timestamp, view ID, the
    /// sender signature, and for critical transactions the accounts
    /// checksum and difficulty-timestamp window.
    ///
    /// # Errors
    ///
    /// - `NoEligibleParents` when the graph has no attachable leaves
    /// - collapse errors when building a critical transaction's checksum
    pub fn attach_sender(&self, mut tx: Transaction) -> Result<Transaction> {
        tx.sender = self.keys.account();

        tx.parents = self.graph.find_eligible_parents();
        if tx.parents.is_empty() {
            return Err(LedgerError::NoEligibleParents);
        }

        tx.timestamp = now_ms();
        for parent_id in &tx.parents {
            if let Some(parent) = self.graph.lookup(parent_id) {
                if tx.timestamp <= parent.timestamp {
                    tx.timestamp = parent.timestamp + 1;
                }
            }
        }

        tx.view_id = self.graph.view_id();

        tx.sender_signature = self.keys.sign(&tx.sender_sign_message());

        if tx.is_critical(self.graph.difficulty()) {
            let snapshot = self.collapse_transactions(&tx, false)?;
            tx.accounts_checksum = snapshot.checksum();

            let root = self.graph.root();
            let mut timestamps = root.difficulty_timestamps.clone();
            timestamps.push(root.timestamp);

            let window = critical_timestamp_window_size(tx.view_id, &self.config);
            if timestamps.len() > window {
                timestamps.drain(..timestamps.len() - window);
            }
            tx.difficulty_timestamps = timestamps;
        }

        tx.rehash();

        Ok(tx)
    }

    /// Validates and admits a transaction into the view-graph. A duplicate
    /// is an idempotent no-op. A newly admitted critical transaction
    /// becomes the round preference when none is set.
    ///
    /// # Errors
    ///
    /// Everything `assert_valid`, `assert_in_view`, `assert_valid_ancestry`
    /// and the critical-checksum recomputation can raise.
    pub fn add_transaction(&self, tx: Transaction) -> Result<()> {
        self.graph.assert_in_view(&tx)?;
        tx.assert_valid(&self.config)?;
        self.graph.assert_valid_ancestry(&tx)?;

        let critical = tx.is_critical(self.graph.difficulty());
        if critical {
            self.assert_collapsible(&tx)?;
        }

        let id = tx.id;
        match self.graph.add_transaction(tx.clone()) {
            Ok(()) => {}
            Err(LedgerError::AlreadyPresent(_)) => return Ok(()),
            Err(err) => return Err(err),
        }

        if critical && self.round.preferred().is_none() && id != self.graph.root().id {
            self.round.prefer(tx);
        }

        Ok(())
    }

    /// Collapses the ancestry of `tx` into a fresh account snapshot,
    /// applying every transaction in causal order.
    ///
    /// Per-transaction application failures are logged and skipped; they
    /// must not abort the collapse, because every honest node has to
    /// compute the same checksum from the same sequence.
    ///
    /// # Errors
    ///
    /// Returns `MissingParents` when the ancestry is incomplete.
    pub fn collapse_transactions(&self, tx: &Transaction, logging: bool) -> Result<Tree> {
        let root = self.graph.root();

        let mut snapshot = self.accounts.snapshot();
        snapshot.set_view_id(root.view_id + 1);

        let mut visited: HashSet<TransactionId> = HashSet::new();
        visited.insert(root.id);

        let mut queue: VecDeque<Arc<Transaction>> = VecDeque::new();
        for parent_id in &tx.parents {
            match self.graph.lookup(parent_id) {
                Some(parent) => queue.push_back(parent),
                None => return Err(LedgerError::MissingParents(vec![*parent_id])),
            }
            visited.insert(*parent_id);
        }

        // Mark ancestors breadth-first, then apply in reverse so the oldest
        // transactions reach the snapshot first.
        let mut apply_order: Vec<Arc<Transaction>> = Vec::new();

        while let Some(popped) = queue.pop_front() {
            for parent_id in &popped.parents {
                if visited.insert(*parent_id) {
                    match self.graph.lookup(parent_id) {
                        Some(parent) => queue.push_back(parent),
                        None => return Err(LedgerError::MissingParents(vec![*parent_id])),
                    }
                }
            }
            apply_order.push(popped);
        }

        let processors = self.processors.read();

        for popped in apply_order.iter().rev() {
            let staged = snapshot.snapshot();

            let applied = processors
                .apply(&mut snapshot, popped)
                .and_then(|()| reward_validators(&self.graph, &mut snapshot, popped, &self.config));

            match applied {
                Ok(()) => {
                    if logging {
                        debug!(tx = %popped.id, sender = %popped.sender, "applied transaction");
                        self.record_deltas(popped, &snapshot);
                    }
                }
                Err(err) => {
                    // Rejected as a whole; the snapshot rolls back to the
                    // state before this transaction.
                    snapshot.revert(&staged);
                    if logging {
                        warn!(tx = %popped.id, %err, "failed to apply transaction");
                    }
                }
            }
        }

        Ok(snapshot)
    }

    /// Recomputes a critical transaction's checksum and compares bit-exact.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCriticalChecksum` on a mismatch.
    pub fn assert_collapsible(&self, tx: &Transaction) -> Result<()> {
        let snapshot = self.collapse_transactions(tx, false)?;

        if snapshot.checksum() != tx.accounts_checksum {
            return Err(LedgerError::InvalidCriticalChecksum {
                claimed: hex::encode(tx.accounts_checksum),
                computed: hex::encode(snapshot.checksum()),
            });
        }

        Ok(())
    }

    /// Installs a new root: commits the collapsed snapshot, resets the
    /// round Snowball and the view-graph, and persists the root
    /// transaction.
    ///
    /// # Errors
    ///
    /// Propagates store write errors.
    pub(crate) fn install_root(&self, new_root: Transaction, snapshot: Tree) -> Result<()> {
        self.accounts.commit(Some(snapshot))?;
        self.round.reset();
        self.graph.reset(Arc::new(new_root.clone()));
        self.store.put(KEY_ROOT_TX, &new_root.marshal())?;
        Ok(())
    }

    /// Writes the per-account audit record for an applied transaction.
    fn record_deltas(&self, tx: &Transaction, snapshot: &Tree) {
        let mut accounts: Vec<AccountId> = vec![tx.sender];
        if tx.tag == Tag::Transfer {
            if let Ok(payload) = crate::processor::TransferPayload::decode(&tx.payload) {
                accounts.push(payload.recipient);
            }
        }

        let mut record = Vec::with_capacity(accounts.len() * 40);
        for account in accounts {
            let balance = crate::accounts::read_balance(snapshot, &account)
                .ok()
                .flatten()
                .unwrap_or(0);
            record.extend_from_slice(account.as_bytes());
            record.extend_from_slice(&balance.to_le_bytes());
        }

        let mut key = KEY_DELTAS.to_vec();
        key.extend_from_slice(tx.id.as_bytes());

        if let Err(err) = self.store.put(&key, &record) {
            warn!(tx = %tx.id, %err, "failed to record audit deltas");
        }
    }
}

/// Seeds the genesis allocations and fabricates the deterministic root
/// transaction committing to them.
fn perform_inception(accounts: &Accounts, config: &Config) -> Result<Transaction> {
    let mut tree = accounts.snapshot();

    for allocation in &config.genesis {
        crate::accounts::write_balance(&mut tree, &allocation.account, allocation.balance)?;
        crate::accounts::write_stake(&mut tree, &allocation.account, allocation.stake)?;
    }

    accounts.commit(Some(tree))?;

    let mut root = Transaction {
        id: TransactionId::ZERO,
        tag: Tag::Nop,
        payload: Vec::new(),
        creator: AccountId::ZERO,
        creator_signature: riptide_crypto::Signature::ZERO,
        sender: AccountId::ZERO,
        sender_signature: riptide_crypto::Signature::ZERO,
        parents: Vec::new(),
        timestamp: 0,
        view_id: 0,
        accounts_checksum: accounts.checksum(),
        difficulty_timestamps: Vec::new(),
    };
    root.rehash();

    Ok(root)
}
