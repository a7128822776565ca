//! The riptide ledger core.
//!
//! riptide is a probabilistic-consensus distributed ledger built on a DAG of
//! signed transactions. Every participant gossips transactions into a
//! view-graph, selects a critical transaction as a round-boundary candidate,
//! and runs a Snowball repeated-sampling vote until the round terminates.
//! Once a round is decided, the ancestry of the winning critical transaction
//! is collapsed, in deterministic order, onto a versioned Merkle account
//! store; the winner becomes the new root and the next round begins.
//!
//! # Architecture
//!
//! - **Transaction model** ([`tx`]): canonical encoding, dual signatures,
//!   critical-transaction difficulty predicate
//! - **View-graph** ([`graph`]): the rooted DAG and its admission rules
//! - **Snowball** ([`snowball`]): stake-weighted repeated-sampling consensus
//! - **State machine** ([`machine`]): gossiping ↔ querying ↔ syncing
//! - **Accounts** ([`accounts`]): typed projections over the Merkle store
//! - **Gossiper** ([`gossip`]): time-and-size batch debouncing to peers
//!
//! The wire transport, WASM execution environment and outer API surfaces are
//! external collaborators; they talk to the core exclusively through the
//! bounded event channels in [`events`].

pub mod accounts;
pub mod events;
pub mod gossip;
pub mod graph;
pub mod machine;
pub mod processor;
pub mod snowball;
pub mod tx;
pub mod wallet;

mod error;
mod ledger;
mod params;
mod reward;
mod timestamp;

pub use error::{Interrupt, LedgerError, Result, Transition};
pub use ledger::Ledger;
pub use params::{Config, GenesisAllocation, SnowballParams};
pub use snowball::Snowball;
pub use tx::{Tag, Transaction};
