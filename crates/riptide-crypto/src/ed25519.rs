//! Ed25519 signing keys.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use riptide_ids::AccountId;
use zeroize::Zeroizing;

use crate::{CryptoError, Result};

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// An Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_LEN]);

impl Signature {
    /// The zero signature, used as a placeholder before signing.
    pub const ZERO: Self = Self([0u8; SIGNATURE_LEN]);

    /// Creates a signature from a slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidSignature` if the slice is not 64 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(CryptoError::InvalidSignature);
        }
        let mut arr = [0u8; SIGNATURE_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Returns the signature bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::ZERO
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A verifying-only Ed25519 public key.
#[derive(Debug, Clone, Copy)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Reconstructs a public key from an account ID.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the bytes are not a valid
    /// Ed25519 point.
    pub fn from_account(account: &AccountId) -> Result<Self> {
        let inner = VerifyingKey::from_bytes(account.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Verifies a signature over a message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::VerificationFailed` if the signature does not
    /// verify against this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.inner
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

/// An Ed25519 keypair.
///
/// The secret half is zeroized when the keypair is dropped.
pub struct Keypair {
    secret: Zeroizing<[u8; 32]>,
    signing: SigningKey,
    account: AccountId,
}

impl Keypair {
    /// Generates a new random keypair.
    #[must_use]
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    /// Reconstructs a keypair from 32 secret bytes.
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&bytes))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let account = AccountId::from_bytes(signing.verifying_key().to_bytes());
        Self {
            secret: Zeroizing::new(signing.to_bytes()),
            signing,
            account,
        }
    }

    /// Returns the account ID (public key) of this keypair.
    #[must_use]
    pub fn account(&self) -> AccountId {
        self.account
    }

    /// Returns the secret key bytes.
    #[must_use]
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Signs a message with this keypair.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(*self.secret)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", self.account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keys = Keypair::generate();
        let sig = keys.sign(b"message");

        let public = PublicKey::from_account(&keys.account()).unwrap();
        assert!(public.verify(b"message", &sig).is_ok());
        assert!(public.verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn test_deterministic_from_secret() {
        let keys = Keypair::from_secret_bytes([7u8; 32]);
        let again = Keypair::from_secret_bytes([7u8; 32]);
        assert_eq!(keys.account(), again.account());
        assert_eq!(keys.sign(b"m").as_bytes(), again.sign(b"m").as_bytes());
    }

    #[test]
    fn test_signature_from_slice_rejects_bad_length() {
        assert!(Signature::from_slice(&[0u8; 63]).is_err());
        assert!(Signature::from_slice(&[0u8; 64]).is_ok());
    }
}
