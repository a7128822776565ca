//! Versioned Merkle AVL tree.
//!
//! The account state of the ledger lives in a balanced binary tree of
//! `(key, value)` byte-string pairs. Every node carries a BLAKE2b-256
//! content hash computed over its serialization; the root hash is the
//! "accounts checksum" committed to by critical transactions.
//!
//! Each tree instance carries a monotonic view ID, incremented once per
//! finalized consensus round. Every node created by a mutation is stamped
//! with the tree's current view ID, which makes it possible to stream the
//! difference between two versions of the tree ([`Tree::dump_diff`]) and to
//! graft such a stream onto a stale replica ([`Tree::apply_diff`]).
//!
//! Trees are copy-on-write: [`Tree::snapshot`] is a cheap handle that shares
//! all node storage with its parent, and mutations on either side never
//! disturb the other.

mod cache;
mod diff;
mod error;
mod node;
mod tree;

pub use cache::NodeCache;
pub use error::{Result, TreeError};
pub use node::{Node, NodeKind};
pub use tree::Tree;

/// Well-known store key holding the committed root hash.
pub const KEY_ROOT: &[u8] = b"root";

/// Well-known store key holding the committed view ID (8 bytes LE).
pub const KEY_VIEW_ID: &[u8] = b"view_id";
