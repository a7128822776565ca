//! Cryptographic primitives for riptide.
//!
//! Every transaction carries two Ed25519 signatures: the creator's over the
//! tag and payload, and the sender's over the canonical encoding. This crate
//! wraps the signing and verification primitives used for both.

mod ed25519;

pub use ed25519::{Keypair, PublicKey, Signature, SIGNATURE_LEN};

use thiserror::Error;

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key bytes were malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Signature bytes were malformed.
    #[error("invalid signature encoding")]
    InvalidSignature,

    /// A signature failed to verify.
    #[error("signature verification failed")]
    VerificationFailed,
}
