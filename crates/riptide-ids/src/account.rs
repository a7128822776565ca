//! Account identifier type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::id::IdError;
use crate::ACCOUNT_ID_LEN;

/// A 32-byte account identifier.
///
/// An account is identified by its Ed25519 public key. The zero account is
/// used as a sentinel meaning "no account" in filters and votes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct AccountId([u8; ACCOUNT_ID_LEN]);

impl AccountId {
    /// The zero account ID.
    pub const ZERO: Self = Self([0u8; ACCOUNT_ID_LEN]);

    /// Creates an account ID from a 32-byte array.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ACCOUNT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Creates an account ID from a slice, returning an error if the length is wrong.
    ///
    /// # Errors
    ///
    /// Returns `IdError::InvalidLength` if the slice is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != ACCOUNT_ID_LEN {
            return Err(IdError::InvalidLength {
                expected: ACCOUNT_ID_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; ACCOUNT_ID_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Returns the account ID as a byte array reference.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ACCOUNT_ID_LEN] {
        &self.0
    }

    /// Returns true if this is the zero account ID.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ACCOUNT_ID_LEN]
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self)
    }
}

impl FromStr for AccountId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for AccountId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; ACCOUNT_ID_LEN]> for AccountId {
    fn from(bytes: [u8; ACCOUNT_ID_LEN]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<AccountId> for [u8; ACCOUNT_ID_LEN] {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl Serialize for AccountId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.0))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for AccountId {
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
