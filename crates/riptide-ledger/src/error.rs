//! Error types and control-flow transitions.
//!
//! Fault errors ([`LedgerError`]) describe things that went wrong.
//! [`Transition`] values are not faults: they are the signals workers use to
//! steer the consensus state machine, and they never escape it.

use riptide_avl::TreeError;
use riptide_crypto::CryptoError;
use riptide_db::StoreError;
use riptide_ids::TransactionId;
use thiserror::Error;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The transaction is already admitted; re-admission is an idempotent no-op.
    #[error("transaction {0} already exists in the view-graph")]
    AlreadyPresent(TransactionId),

    /// One or more parents are not yet in the view-graph. Recoverable: the
    /// caller retries after more gossip arrives.
    #[error("missing {} parent transaction(s)", .0.len())]
    MissingParents(Vec<TransactionId>),

    /// Signature, format or view-ID mismatch. The source is ban-scored.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Parent timestamps or depth are inconsistent.
    #[error("invalid ancestry: {0}")]
    InvalidAncestry(String),

    /// The claimed accounts checksum does not match the recomputed one.
    #[error("critical transaction claims accounts checksum {claimed}, but collapsing yields {computed}")]
    InvalidCriticalChecksum { claimed: String, computed: String },

    /// A gossip or query round returned less than alpha positive weight.
    #[error("quorum failed: got {got:.2} positive weight, needed {required:.2}")]
    QuorumFailed { got: f64, required: f64 },

    /// A round-trip timed out. Retryable.
    #[error("timed out: {0}")]
    Timeout(String),

    /// No eligible parents are currently available in the view-graph.
    #[error("no eligible parents available, please try again")]
    NoEligibleParents,

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// State sync failed; the next out-of-sync detection retries.
    #[error("sync failed: {0}")]
    SyncFailed(String),

    /// A cryptographic failure while signing or verifying.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// A failure inside the Merkle account tree.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// An I/O failure from the backing store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Control-flow signals at the state-machine boundary.
///
/// Workers report the first transition that fires; the worker group stops
/// and the trampoline picks the next state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A critical transaction became preferred; leave gossiping for querying.
    PreferredSelected,
    /// The consensus round finalized; leave querying for gossiping.
    RoundFinished,
    /// The node has fallen behind the quorum; enter syncing.
    OutOfSync,
    /// Cooperative cancellation; unwind silently.
    Stopped,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::PreferredSelected => write!(f, "preferred selected"),
            Transition::RoundFinished => write!(f, "consensus round finished"),
            Transition::OutOfSync => write!(f, "out of sync"),
            Transition::Stopped => write!(f, "stopped"),
        }
    }
}

/// What a single worker iteration can report: a state transition, or a fault.
#[derive(Debug)]
pub enum Interrupt {
    /// Steer the state machine.
    Transition(Transition),
    /// Something actually went wrong.
    Fault(LedgerError),
}

impl From<Transition> for Interrupt {
    fn from(transition: Transition) -> Self {
        Interrupt::Transition(transition)
    }
}

impl From<LedgerError> for Interrupt {
    fn from(err: LedgerError) -> Self {
        Interrupt::Fault(err)
    }
}
