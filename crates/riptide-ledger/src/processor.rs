//! Per-tag transaction processors.
//!
//! A processor is a pure function over `(snapshot, transaction)`: it stages
//! its deltas on the snapshot and returns an error to reject the
//! transaction. The four built-in tags are registered at ledger startup; an
//! embedder replaces the contract processor with one backed by its WASM
//! execution environment.

use std::collections::HashMap;
use std::sync::Arc;

use riptide_avl::Tree;
use riptide_ids::AccountId;

use crate::accounts::{
    read_balance, read_nonce, read_stake, write_balance, write_contract_code, write_nonce,
    write_stake,
};
use crate::tx::{Tag, Transaction, MIN_TRANSFER_PAYLOAD};
use crate::{LedgerError, Result};

/// A registered transaction processor.
pub type ProcessorFn = dyn Fn(&mut Tree, &Transaction) -> Result<()> + Send + Sync;

/// The processor registry: one pure function per tag byte.
pub struct Processors {
    map: HashMap<Tag, Arc<ProcessorFn>>,
}

impl Processors {
    /// Builds the registry with the four built-in processors.
    #[must_use]
    pub fn builtin() -> Self {
        let mut map: HashMap<Tag, Arc<ProcessorFn>> = HashMap::new();
        map.insert(Tag::Nop, Arc::new(process_nop));
        map.insert(Tag::Transfer, Arc::new(process_transfer));
        map.insert(Tag::Contract, Arc::new(process_contract));
        map.insert(Tag::Stake, Arc::new(process_stake));
        Self { map }
    }

    /// Replaces the processor for a tag.
    pub fn register<F>(&mut self, tag: Tag, processor: F)
    where
        F: Fn(&mut Tree, &Transaction) -> Result<()> + Send + Sync + 'static,
    {
        self.map.insert(tag, Arc::new(processor));
    }

    /// Dispatches a transaction to the processor registered for its tag.
    ///
    /// # Errors
    ///
    /// Returns whatever the processor returns, or `InvalidTransaction` when
    /// no processor is registered for the tag.
    pub fn apply(&self, snapshot: &mut Tree, tx: &Transaction) -> Result<()> {
        let processor = self.map.get(&tx.tag).ok_or_else(|| {
            LedgerError::InvalidTransaction(format!("no processor for tag {:?}", tx.tag))
        })?;
        processor(snapshot, tx)
    }
}

fn bump_nonce(snapshot: &mut Tree, account: &AccountId) -> Result<()> {
    let nonce = read_nonce(snapshot, account)?.unwrap_or(0);
    write_nonce(snapshot, account, nonce + 1)
}

fn process_nop(snapshot: &mut Tree, tx: &Transaction) -> Result<()> {
    bump_nonce(snapshot, &tx.sender)
}

/// Transfer payload: recipient (32) ‖ amount (8 LE) ‖ gas limit (8 LE) ‖
/// additional invocation bytes.
pub struct TransferPayload {
    /// Receiving account.
    pub recipient: AccountId,
    /// Amount moved.
    pub amount: u64,
    /// Gas limit for a contract recipient.
    pub gas_limit: u64,
    /// Opaque invocation bytes handed to a contract recipient.
    pub extra: Vec<u8>,
}

impl TransferPayload {
    /// Decodes a transfer payload.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidTransaction` when the payload is too
    /// short.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < MIN_TRANSFER_PAYLOAD {
            return Err(LedgerError::InvalidTransaction(format!(
                "transfer payload of {} bytes is too short",
                payload.len()
            )));
        }

        let recipient = AccountId::from_slice(&payload[0..32]).expect("length checked");
        let amount = u64::from_le_bytes(payload[32..40].try_into().expect("length checked"));
        let gas_limit = u64::from_le_bytes(payload[40..48].try_into().expect("length checked"));

        Ok(Self {
            recipient,
            amount,
            gas_limit,
            extra: payload[48..].to_vec(),
        })
    }
}

fn process_transfer(snapshot: &mut Tree, tx: &Transaction) -> Result<()> {
    let payload = TransferPayload::decode(&tx.payload)?;

    let sender_balance = read_balance(snapshot, &tx.sender)?.unwrap_or(0);
    if sender_balance < payload.amount {
        return Err(LedgerError::InvalidTransaction(format!(
            "sender balance {sender_balance} cannot cover transfer of {}",
            payload.amount
        )));
    }

    let recipient_balance = read_balance(snapshot, &payload.recipient)?.unwrap_or(0);

    write_balance(snapshot, &tx.sender, sender_balance - payload.amount)?;
    write_balance(snapshot, &payload.recipient, recipient_balance + payload.amount)?;

    bump_nonce(snapshot, &tx.sender)
}

/// Stake payload: op byte (1 = place, 0 = withdraw) ‖ amount (8 LE).
pub struct StakePayload {
    /// True to move balance into stake, false to move stake back out.
    pub place: bool,
    /// Amount moved.
    pub amount: u64,
}

impl StakePayload {
    /// Decodes a stake payload.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidTransaction` on a malformed payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != 9 {
            return Err(LedgerError::InvalidTransaction(format!(
                "stake payload must be 9 bytes, got {}",
                payload.len()
            )));
        }
        let place = match payload[0] {
            0 => false,
            1 => true,
            other => {
                return Err(LedgerError::InvalidTransaction(format!(
                    "unknown stake op {other}"
                )))
            }
        };
        let amount = u64::from_le_bytes(payload[1..9].try_into().expect("length checked"));
        Ok(Self { place, amount })
    }
}

fn process_stake(snapshot: &mut Tree, tx: &Transaction) -> Result<()> {
    let payload = StakePayload::decode(&tx.payload)?;

    let balance = read_balance(snapshot, &tx.sender)?.unwrap_or(0);
    let stake = read_stake(snapshot, &tx.sender)?.unwrap_or(0);

    if payload.place {
        if balance < payload.amount {
            return Err(LedgerError::InvalidTransaction(format!(
                "sender balance {balance} cannot cover stake of {}",
                payload.amount
            )));
        }
        write_balance(snapshot, &tx.sender, balance - payload.amount)?;
        write_stake(snapshot, &tx.sender, stake + payload.amount)?;
    } else {
        if stake < payload.amount {
            return Err(LedgerError::InvalidTransaction(format!(
                "sender stake {stake} cannot cover withdrawal of {}",
                payload.amount
            )));
        }
        write_stake(snapshot, &tx.sender, stake - payload.amount)?;
        write_balance(snapshot, &tx.sender, balance + payload.amount)?;
    }

    bump_nonce(snapshot, &tx.sender)
}

/// The built-in contract processor stores the module under the contract
/// account derived from the transaction ID. Invocation belongs to the WASM
/// execution collaborator, which registers its own processor for this tag.
fn process_contract(snapshot: &mut Tree, tx: &Transaction) -> Result<()> {
    if tx.payload.is_empty() {
        return Err(LedgerError::InvalidTransaction(
            "contract payload is empty".to_string(),
        ));
    }

    let contract = AccountId::from_bytes(*tx.id.as_bytes());
    write_contract_code(snapshot, &contract, &tx.payload)?;

    bump_nonce(snapshot, &tx.sender)
}
