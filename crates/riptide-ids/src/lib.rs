//! Identifier types for the riptide ledger.
//!
//! This crate provides the core identifier types used throughout riptide:
//! - [`TransactionId`]: the BLAKE2b-256 hash of a transaction's canonical encoding
//! - [`AccountId`]: a 32-byte Ed25519 public key identifying an account
//!
//! Both types render as lowercase hex for human-readable representation.

mod account;
mod hashing;
mod id;

pub use account::AccountId;
pub use hashing::{hash256, Blake2b256, Hash256};
pub use id::{IdError, TransactionId};

/// Length of a transaction ID in bytes (32 bytes / 256 bits).
pub const TRANSACTION_ID_LEN: usize = 32;

/// Length of an account ID in bytes (an Ed25519 public key).
pub const ACCOUNT_ID_LEN: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_roundtrip() {
        let id = TransactionId::from_bytes([42u8; TRANSACTION_ID_LEN]);
        let encoded = id.to_string();
        let decoded = encoded.parse::<TransactionId>().unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn test_account_id_roundtrip() {
        let id = AccountId::from_bytes([42u8; ACCOUNT_ID_LEN]);
        let encoded = id.to_string();
        let decoded = encoded.parse::<AccountId>().unwrap();
        assert_eq!(id, decoded);
    }
}
