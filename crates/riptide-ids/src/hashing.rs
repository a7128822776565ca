//! BLAKE2b-256 content hashing.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

/// The BLAKE2b hasher parameterized to a 32-byte digest.
pub type Blake2b256 = Blake2b<U32>;

/// A 32-byte BLAKE2b-256 digest.
pub type Hash256 = [u8; 32];

/// Computes the BLAKE2b-256 hash of the given bytes.
#[must_use]
pub fn hash256(bytes: &[u8]) -> Hash256 {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash256_deterministic() {
        assert_eq!(hash256(b"riptide"), hash256(b"riptide"));
        assert_ne!(hash256(b"riptide"), hash256(b"undertow"));
    }

    #[test]
    fn test_hash256_incremental_matches_oneshot() {
        let mut hasher = Blake2b256::new();
        hasher.update(b"rip");
        hasher.update(b"tide");
        let incremental: Hash256 = hasher.finalize().into();
        assert_eq!(incremental, hash256(b"riptide"));
    }
}
