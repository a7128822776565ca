//! 32-byte transaction identifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::hashing::hash256;
use crate::TRANSACTION_ID_LEN;

/// A 32-byte (256-bit) transaction identifier.
///
/// A transaction's ID is the BLAKE2b-256 hash of its canonical encoding,
/// including both of its signatures.
///
/// # String Representation
///
/// IDs render as lowercase hex.
///
/// # Examples
///
/// ```
/// use riptide_ids::TransactionId;
///
/// let id = TransactionId::from_bytes([0u8; 32]);
/// assert!(id.is_zero());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct TransactionId([u8; TRANSACTION_ID_LEN]);

/// Errors that can occur when parsing an ID.
#[derive(Debug, Error)]
pub enum IdError {
    /// The hex decoding failed.
    #[error("hex decoding failed: {0}")]
    Hex(#[from] hex::FromHexError),

    /// The decoded bytes have the wrong length.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

impl TransactionId {
    /// The zero ID, used as a sentinel for "no transaction".
    pub const ZERO: Self = Self([0u8; TRANSACTION_ID_LEN]);

    /// Creates an ID from a 32-byte array.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; TRANSACTION_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Creates an ID from a slice, returning an error if the length is wrong.
    ///
    /// # Errors
    ///
    /// Returns `IdError::InvalidLength` if the slice is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != TRANSACTION_ID_LEN {
            return Err(IdError::InvalidLength {
                expected: TRANSACTION_ID_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; TRANSACTION_ID_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Computes an ID from the BLAKE2b-256 hash of the given bytes.
    #[must_use]
    pub fn from_hash(bytes: &[u8]) -> Self {
        Self(hash256(bytes))
    }

    /// Returns the ID as a byte array reference.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_LEN] {
        &self.0
    }

    /// Returns true if this is the zero ID.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; TRANSACTION_ID_LEN]
    }

    /// Returns the hex-encoded representation of this ID.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self)
    }
}

impl FromStr for TransactionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for TransactionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; TRANSACTION_ID_LEN]> for TransactionId {
    fn from(bytes: [u8; TRANSACTION_ID_LEN]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<TransactionId> for [u8; TRANSACTION_ID_LEN] {
    fn from(id: TransactionId) -> Self {
        id.0
    }
}

impl Serialize for TransactionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            Self::from_slice(&bytes).map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_id() {
        let id = TransactionId::ZERO;
        assert!(id.is_zero());
        assert_eq!(id.as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn test_from_slice() {
        let bytes = [42u8; 32];
        let id = TransactionId::from_slice(&bytes).unwrap();
        assert_eq!(id.as_bytes(), &bytes);

        // Wrong length should fail
        assert!(TransactionId::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_from_hash() {
        let id = TransactionId::from_hash(b"test");
        assert!(!id.is_zero());

        // Same input should produce same hash
        assert_eq!(id, TransactionId::from_hash(b"test"));

        // Different input should produce different hash
        assert_ne!(id, TransactionId::from_hash(b"other"));
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let id1 = TransactionId::from_bytes([0u8; 32]);
        let id2 = TransactionId::from_bytes([1u8; 32]);
        assert!(id1 < id2);

        let mut high_tail = [0u8; 32];
        high_tail[31] = 0xff;
        assert!(TransactionId::from_bytes(high_tail) < id2);
    }

    #[test]
    fn test_json_serialization() {
        let id = TransactionId::from_bytes([42u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        let parsed: TransactionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
