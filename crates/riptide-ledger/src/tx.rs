//! Transaction model and canonical encoding.
//!
//! A transaction is immutable once signed. Its creator signs the tag and
//! payload; the node that attaches it to the view-graph fills in parents,
//! timestamp, view ID and (for critical transactions) the accounts checksum
//! and difficulty-timestamp window, then signs the whole canonical encoding
//! as the sender. The transaction ID is the BLAKE2b-256 of the full
//! encoding, both signatures included.

use riptide_crypto::{Keypair, PublicKey, Signature, SIGNATURE_LEN};
use riptide_ids::{hash256, AccountId, Hash256, TransactionId};

use crate::timestamp::now_ms;
use crate::{Config, LedgerError, Result};

/// Maximum payload size of a transfer transaction.
const MAX_TRANSFER_PAYLOAD: usize = 10 * 1024;

/// Exact payload size of a stake transaction: op byte plus amount.
const STAKE_PAYLOAD_LEN: usize = 9;

/// Maximum size of a contract module payload.
const MAX_CONTRACT_PAYLOAD: usize = 1024 * 1024;

/// The minimum transfer payload: recipient, amount and gas limit.
pub(crate) const MIN_TRANSFER_PAYLOAD: usize = 32 + 8 + 8;

/// One-byte transaction tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Carries no payload; exists to thicken the DAG.
    Nop = 0,
    /// Moves funds: recipient, amount, gas limit, extra invocation bytes.
    Transfer = 1,
    /// Deploys or invokes a contract module.
    Contract = 2,
    /// Places or withdraws stake.
    Stake = 3,
}

impl Tag {
    /// Decodes a tag byte.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidTransaction` on an unknown byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Tag::Nop),
            1 => Ok(Tag::Transfer),
            2 => Ok(Tag::Contract),
            3 => Ok(Tag::Stake),
            other => Err(LedgerError::InvalidTransaction(format!(
                "unknown transaction tag {other}"
            ))),
        }
    }

    /// Largest payload this tag accepts.
    #[must_use]
    pub fn max_payload_len(self) -> usize {
        match self {
            Tag::Nop => 0,
            Tag::Transfer => MAX_TRANSFER_PAYLOAD,
            Tag::Contract => MAX_CONTRACT_PAYLOAD,
            Tag::Stake => STAKE_PAYLOAD_LEN,
        }
    }
}

/// A signed ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// BLAKE2b-256 of the full canonical encoding.
    pub id: TransactionId,

    /// One-byte tag selecting the processor.
    pub tag: Tag,
    /// Opaque payload, interpreted per tag.
    pub payload: Vec<u8>,

    /// Account that authored tag and payload.
    pub creator: AccountId,
    /// Creator's signature over tag and payload.
    pub creator_signature: Signature,

    /// Node that attached the transaction to the graph.
    pub sender: AccountId,
    /// Sender's signature over the canonical encoding.
    pub sender_signature: Signature,

    /// Parent transaction IDs, sorted lexicographically, duplicate-free.
    pub parents: Vec<TransactionId>,
    /// Millisecond timestamp, strictly greater than every parent's.
    pub timestamp: u64,
    /// View ID at attachment time.
    pub view_id: u64,

    /// Critical only: checksum of the accounts tree after collapsing this
    /// transaction's ancestry. Zero otherwise.
    pub accounts_checksum: Hash256,
    /// Critical only: bounded history of prior root timestamps.
    pub difficulty_timestamps: Vec<u64>,
}

impl Transaction {
    /// Creates a transaction signed by its creator. Parents, timestamp,
    /// view ID and the sender signature are attached later by a node.
    #[must_use]
    pub fn new(creator: &Keypair, tag: Tag, payload: Vec<u8>) -> Self {
        let mut message = Vec::with_capacity(1 + payload.len());
        message.push(tag as u8);
        message.extend_from_slice(&payload);

        let creator_signature = creator.sign(&message);

        let mut tx = Self {
            id: TransactionId::ZERO,
            tag,
            payload,
            creator: creator.account(),
            creator_signature,
            sender: AccountId::ZERO,
            sender_signature: Signature::ZERO,
            parents: Vec::new(),
            timestamp: 0,
            view_id: 0,
            accounts_checksum: [0u8; 32],
            difficulty_timestamps: Vec::new(),
        };
        tx.rehash();
        tx
    }

    /// True when the critical-only fields are present in the encoding.
    fn has_critical_fields(&self) -> bool {
        self.accounts_checksum != [0u8; 32] || !self.difficulty_timestamps.is_empty()
    }

    fn encode(&self, include_critical: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            1 + 4 + self.payload.len() + 32 + 64 + 1 + 32 * self.parents.len() + 8 + 8 + 32,
        );

        buf.push(self.tag as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(self.creator.as_bytes());
        buf.extend_from_slice(self.creator_signature.as_bytes());

        buf.push(self.parents.len() as u8);
        for parent in &self.parents {
            buf.extend_from_slice(parent.as_bytes());
        }

        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.view_id.to_le_bytes());
        buf.extend_from_slice(self.sender.as_bytes());

        if include_critical && self.has_critical_fields() {
            buf.extend_from_slice(&self.accounts_checksum);
            buf.push(self.difficulty_timestamps.len() as u8);
            for timestamp in &self.difficulty_timestamps {
                buf.extend_from_slice(&timestamp.to_le_bytes());
            }
        }

        buf
    }

    /// Serializes what the sender signs: the canonical layout up to the
    /// sender account, without the critical-only fields.
    ///
    /// The critical fields cannot be covered by the sender signature,
    /// because criticality itself is derived from that signature. They stay
    /// tamper-evident through the transaction ID, and the accounts checksum
    /// is recomputed from scratch by every validating node regardless.
    #[must_use]
    pub fn sender_sign_message(&self) -> Vec<u8> {
        self.encode(false)
    }

    /// Serializes the full canonical layout up to but not including the
    /// sender signature.
    #[must_use]
    pub fn write_canonical(&self) -> Vec<u8> {
        self.encode(true)
    }

    /// Serializes the full wire encoding: canonical bytes plus the sender
    /// signature.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = self.write_canonical();
        buf.extend_from_slice(self.sender_signature.as_bytes());
        buf
    }

    /// Decodes a transaction from its wire encoding.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidTransaction` on any malformed input.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0usize;

        let tag = Tag::from_byte(take(bytes, &mut pos, 1)?[0])?;
        let payload_len = u32::from_le_bytes(take(bytes, &mut pos, 4)?.try_into().unwrap()) as usize;
        let payload = take(bytes, &mut pos, payload_len)?.to_vec();

        let creator = AccountId::from_slice(take(bytes, &mut pos, 32)?).expect("length checked");
        let creator_signature =
            Signature::from_slice(take(bytes, &mut pos, SIGNATURE_LEN)?).expect("length checked");

        let parent_count = take(bytes, &mut pos, 1)?[0] as usize;
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents
                .push(TransactionId::from_slice(take(bytes, &mut pos, 32)?).expect("length checked"));
        }

        let timestamp = u64::from_le_bytes(take(bytes, &mut pos, 8)?.try_into().unwrap());
        let view_id = u64::from_le_bytes(take(bytes, &mut pos, 8)?.try_into().unwrap());
        let sender = AccountId::from_slice(take(bytes, &mut pos, 32)?).expect("length checked");

        // What remains is either just the sender signature, or the critical
        // fields followed by it.
        let remaining = bytes.len() - pos;
        let (accounts_checksum, difficulty_timestamps) = if remaining == SIGNATURE_LEN {
            ([0u8; 32], Vec::new())
        } else {
            let mut checksum = [0u8; 32];
            checksum.copy_from_slice(take(bytes, &mut pos, 32)?);

            let count = take(bytes, &mut pos, 1)?[0] as usize;
            let mut timestamps = Vec::with_capacity(count);
            for _ in 0..count {
                timestamps.push(u64::from_le_bytes(
                    take(bytes, &mut pos, 8)?.try_into().unwrap(),
                ));
            }
            (checksum, timestamps)
        };

        let sender_signature =
            Signature::from_slice(take(bytes, &mut pos, SIGNATURE_LEN)?).expect("length checked");

        if pos != bytes.len() {
            return Err(LedgerError::InvalidTransaction(
                "trailing bytes after transaction".to_string(),
            ));
        }

        let mut tx = Self {
            id: TransactionId::ZERO,
            tag,
            payload,
            creator,
            creator_signature,
            sender,
            sender_signature,
            parents,
            timestamp,
            view_id,
            accounts_checksum,
            difficulty_timestamps,
        };
        tx.rehash();
        Ok(tx)
    }

    /// Recomputes the transaction ID from the current contents.
    pub fn rehash(&mut self) {
        self.id = TransactionId::from_hash(&self.marshal());
    }

    /// A transaction is critical iff the leading zero bits of
    /// BLAKE2b-256(sender ‖ sender-signature) meet the difficulty.
    #[must_use]
    pub fn is_critical(&self, difficulty: u64) -> bool {
        let mut buf = Vec::with_capacity(32 + SIGNATURE_LEN);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(self.sender_signature.as_bytes());

        prefix_len(&hash256(&buf)) >= difficulty
    }

    /// Logical units carried by this transaction, used for bandwidth
    /// metering by the gossiper.
    #[must_use]
    pub fn logical_units(&self) -> u64 {
        1 + self.parents.len() as u64
    }

    /// Validates everything about the transaction that does not require the
    /// view-graph: signatures, parent ordering, payload bounds and clock
    /// skew.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidTransaction` describing the first
    /// violated rule.
    pub fn assert_valid(&self, config: &Config) -> Result<()> {
        if self.payload.len() > self.tag.max_payload_len() {
            return Err(LedgerError::InvalidTransaction(format!(
                "payload of {} bytes exceeds bound for tag {:?}",
                self.payload.len(),
                self.tag
            )));
        }

        for pair in self.parents.windows(2) {
            if pair[0] >= pair[1] {
                return Err(LedgerError::InvalidTransaction(
                    "parent IDs must be sorted and duplicate-free".to_string(),
                ));
            }
        }

        let now = now_ms();
        if self.timestamp > now + config.max_timestamp_skew_ms
            || self.timestamp + config.max_timestamp_skew_ms < now
        {
            return Err(LedgerError::InvalidTransaction(format!(
                "timestamp {} outside the accepted skew window",
                self.timestamp
            )));
        }

        let mut message = Vec::with_capacity(1 + self.payload.len());
        message.push(self.tag as u8);
        message.extend_from_slice(&self.payload);

        PublicKey::from_account(&self.creator)
            .and_then(|key| key.verify(&message, &self.creator_signature))
            .map_err(|_| {
                LedgerError::InvalidTransaction("creator signature does not verify".to_string())
            })?;

        PublicKey::from_account(&self.sender)
            .and_then(|key| key.verify(&self.sender_sign_message(), &self.sender_signature))
            .map_err(|_| {
                LedgerError::InvalidTransaction("sender signature does not verify".to_string())
            })?;

        if self.id != TransactionId::from_hash(&self.marshal()) {
            return Err(LedgerError::InvalidTransaction(
                "transaction ID does not match its contents".to_string(),
            ));
        }

        Ok(())
    }
}

/// Number of leading zero bits of a hash.
#[must_use]
pub fn prefix_len(hash: &Hash256) -> u64 {
    let mut bits = 0u64;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros() as u64;
            break;
        }
    }
    bits
}

/// Difficulty for the next critical transaction, derived from the root's
/// difficulty-timestamp window: the base difficulty scaled by the ratio of
/// the median inter-root delta to the target delta.
#[must_use]
pub fn compute_difficulty(root: &Transaction, config: &Config) -> u64 {
    let mut timestamps = root.difficulty_timestamps.clone();
    timestamps.push(root.timestamp);

    if timestamps.len() < 2 {
        return config.min_difficulty;
    }

    let deltas: Vec<u64> = timestamps
        .windows(2)
        .map(|pair| pair[1].saturating_sub(pair[0]))
        .collect();

    let median = crate::timestamp::median_timestamp(&deltas);
    if median == 0 {
        return config.min_difficulty;
    }

    let ratio = median as f64 / config.expected_consensus_time_ms as f64;
    let scaled = (config.min_difficulty as f64 * ratio * config.difficulty_scale_factor) as u64;

    scaled.clamp(config.min_difficulty, 255)
}

/// Size of the difficulty-timestamp window a critical transaction at the
/// given view carries. The window grows with the view ID up to the
/// configured maximum.
#[must_use]
pub fn critical_timestamp_window_size(view_id: u64, config: &Config) -> usize {
    (view_id as usize).min(config.max_difficulty_timestamps)
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    if bytes.len() < *pos + len {
        return Err(LedgerError::InvalidTransaction(
            "truncated transaction".to_string(),
        ));
    }
    let slice = &bytes[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Keypair {
        Keypair::from_secret_bytes([7u8; 32])
    }

    fn attach(tx: &mut Transaction, keys: &Keypair) {
        tx.sender = keys.account();
        tx.parents = vec![
            TransactionId::from_bytes([1u8; 32]),
            TransactionId::from_bytes([2u8; 32]),
        ];
        tx.timestamp = now_ms();
        tx.view_id = 1;
        tx.sender_signature = keys.sign(&tx.sender_sign_message());
        tx.rehash();
    }

    #[test]
    fn test_marshal_roundtrip() {
        let mut tx = Transaction::new(&keys(), Tag::Transfer, vec![0u8; MIN_TRANSFER_PAYLOAD]);
        attach(&mut tx, &keys());

        let decoded = Transaction::unmarshal(&tx.marshal()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.id, tx.id);
    }

    #[test]
    fn test_marshal_roundtrip_critical_fields() {
        let mut tx = Transaction::new(&keys(), Tag::Nop, Vec::new());
        tx.accounts_checksum = [9u8; 32];
        tx.difficulty_timestamps = vec![100, 200, 300];
        attach(&mut tx, &keys());

        let decoded = Transaction::unmarshal(&tx.marshal()).unwrap();
        assert_eq!(decoded.accounts_checksum, [9u8; 32]);
        assert_eq!(decoded.difficulty_timestamps, vec![100, 200, 300]);
        assert_eq!(decoded, tx);
    }

    #[test]
    fn test_unmarshal_rejects_truncation() {
        let mut tx = Transaction::new(&keys(), Tag::Nop, Vec::new());
        attach(&mut tx, &keys());

        let bytes = tx.marshal();
        assert!(Transaction::unmarshal(&bytes[..bytes.len() - 1]).is_err());
        assert!(Transaction::unmarshal(&[]).is_err());
    }

    #[test]
    fn test_assert_valid_accepts_well_formed() {
        let mut tx = Transaction::new(&keys(), Tag::Nop, Vec::new());
        attach(&mut tx, &keys());

        tx.assert_valid(&Config::default()).unwrap();
    }

    #[test]
    fn test_assert_valid_rejects_tampering() {
        let mut tx = Transaction::new(&keys(), Tag::Nop, Vec::new());
        attach(&mut tx, &keys());

        tx.timestamp += 1;
        tx.rehash();
        assert!(matches!(
            tx.assert_valid(&Config::default()),
            Err(LedgerError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_assert_valid_rejects_unsorted_parents() {
        let mut tx = Transaction::new(&keys(), Tag::Nop, Vec::new());
        attach(&mut tx, &keys());

        tx.parents = vec![
            TransactionId::from_bytes([2u8; 32]),
            TransactionId::from_bytes([1u8; 32]),
        ];
        tx.sender_signature = keys().sign(&tx.sender_sign_message());
        tx.rehash();

        assert!(matches!(
            tx.assert_valid(&Config::default()),
            Err(LedgerError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_assert_valid_rejects_oversized_payload() {
        let mut tx = Transaction::new(&keys(), Tag::Nop, vec![1]);
        attach(&mut tx, &keys());

        assert!(matches!(
            tx.assert_valid(&Config::default()),
            Err(LedgerError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_prefix_len() {
        let mut hash = [0u8; 32];
        assert_eq!(prefix_len(&hash), 256);

        hash[0] = 0b0000_1000;
        assert_eq!(prefix_len(&hash), 4);

        hash[0] = 0;
        hash[1] = 0b0100_0000;
        assert_eq!(prefix_len(&hash), 9);
    }

    #[test]
    fn test_zero_difficulty_makes_everything_critical() {
        let mut tx = Transaction::new(&keys(), Tag::Nop, Vec::new());
        attach(&mut tx, &keys());
        assert!(tx.is_critical(0));
    }

    #[test]
    fn test_compute_difficulty_tracks_pacing() {
        let config = Config::default();

        let mut root = Transaction::new(&keys(), Tag::Nop, Vec::new());
        root.timestamp = 10_000;
        assert_eq!(compute_difficulty(&root, &config), config.min_difficulty);

        // Rounds twice as slow as the target double the difficulty.
        root.difficulty_timestamps = vec![2_000, 4_000, 6_000, 8_000];
        assert_eq!(compute_difficulty(&root, &config), config.min_difficulty * 2);

        // Rounds faster than the target clamp at the base difficulty.
        root.difficulty_timestamps = vec![9_700, 9_800, 9_900];
        assert_eq!(compute_difficulty(&root, &config), config.min_difficulty);
    }

    #[test]
    fn test_critical_timestamp_window_grows_with_view() {
        let config = Config::default();
        assert_eq!(critical_timestamp_window_size(0, &config), 0);
        assert_eq!(critical_timestamp_window_size(3, &config), 3);
        assert_eq!(
            critical_timestamp_window_size(1_000, &config),
            config.max_difficulty_timestamps
        );
    }
}
