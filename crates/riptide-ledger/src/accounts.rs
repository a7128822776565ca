//! Typed account projections over the Merkle store.
//!
//! Account state lives in the tree under flat keys of the form
//! `kind ‖ public-key`, with one kind byte per projection. All integers are
//! little-endian `u64`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use riptide_avl::Tree;
use riptide_db::Store;
use riptide_ids::{AccountId, Hash256};

use crate::Result;

/// Kind byte for the balance projection.
pub const KIND_BALANCE: u8 = 0x01;
/// Kind byte for the stake projection.
pub const KIND_STAKE: u8 = 0x02;
/// Kind byte for the nonce projection.
pub const KIND_NONCE: u8 = 0x03;
/// Kind byte for the contract-code projection.
pub const KIND_CONTRACT_CODE: u8 = 0x04;

fn account_key(kind: u8, account: &AccountId) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = kind;
    key[1..].copy_from_slice(account.as_bytes());
    key
}

fn read_u64(tree: &Tree, kind: u8, account: &AccountId) -> Result<Option<u64>> {
    let value = tree.lookup(&account_key(kind, account))?;
    Ok(value.and_then(|bytes| {
        let bytes: [u8; 8] = bytes.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }))
}

fn write_u64(tree: &mut Tree, kind: u8, account: &AccountId, value: u64) -> Result<()> {
    tree.insert(&account_key(kind, account), &value.to_le_bytes())?;
    Ok(())
}

/// Reads an account's balance.
pub fn read_balance(tree: &Tree, account: &AccountId) -> Result<Option<u64>> {
    read_u64(tree, KIND_BALANCE, account)
}

/// Writes an account's balance.
pub fn write_balance(tree: &mut Tree, account: &AccountId, balance: u64) -> Result<()> {
    write_u64(tree, KIND_BALANCE, account, balance)
}

/// Reads an account's stake.
pub fn read_stake(tree: &Tree, account: &AccountId) -> Result<Option<u64>> {
    read_u64(tree, KIND_STAKE, account)
}

/// Writes an account's stake.
pub fn write_stake(tree: &mut Tree, account: &AccountId, stake: u64) -> Result<()> {
    write_u64(tree, KIND_STAKE, account, stake)
}

/// Reads an account's nonce.
pub fn read_nonce(tree: &Tree, account: &AccountId) -> Result<Option<u64>> {
    read_u64(tree, KIND_NONCE, account)
}

/// Writes an account's nonce.
pub fn write_nonce(tree: &mut Tree, account: &AccountId, nonce: u64) -> Result<()> {
    write_u64(tree, KIND_NONCE, account, nonce)
}

/// Reads a contract's module bytes.
pub fn read_contract_code(tree: &Tree, account: &AccountId) -> Result<Option<Vec<u8>>> {
    Ok(tree.lookup(&account_key(KIND_CONTRACT_CODE, account))?)
}

/// Writes a contract's module bytes.
pub fn write_contract_code(tree: &mut Tree, account: &AccountId, code: &[u8]) -> Result<()> {
    tree.insert(&account_key(KIND_CONTRACT_CODE, account), code)?;
    Ok(())
}

/// The canonical accounts tree.
///
/// The tree behind the lock is the committed ledger state; everyone else
/// works against snapshots. Committing a collapsed snapshot swaps it in and
/// flushes it to the store.
pub struct Accounts {
    tree: RwLock<Tree>,
}

impl Accounts {
    /// Opens the accounts tree over the given store.
    ///
    /// # Errors
    ///
    /// Propagates store read errors.
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        Ok(Self {
            tree: RwLock::new(Tree::new(store)?),
        })
    }

    /// Takes a snapshot of the committed state.
    #[must_use]
    pub fn snapshot(&self) -> Tree {
        self.tree.read().snapshot()
    }

    /// Commits the given snapshot as the new canonical state, or just
    /// flushes the current one when `None`.
    ///
    /// # Errors
    ///
    /// Propagates store write errors.
    pub fn commit(&self, new_state: Option<Tree>) -> Result<()> {
        let mut tree = self.tree.write();
        if let Some(new_state) = new_state {
            *tree = new_state;
        }
        tree.commit()?;
        Ok(())
    }

    /// The committed accounts checksum.
    #[must_use]
    pub fn checksum(&self) -> Hash256 {
        self.tree.read().checksum()
    }
}

/// Stake-weighted vote distribution over a set of voters.
///
/// Each voter's stake is floored at `minimum_stake` so that an all-idle
/// validator set still yields a usable distribution. Weights are normalized
/// so a full response from all `k` sampled peers sums to one; missing
/// responders proportionally shrink the achievable total.
#[must_use]
pub fn compute_stake_distribution(
    snapshot: &Tree,
    voters: &[AccountId],
    k: usize,
    minimum_stake: u64,
) -> HashMap<AccountId, f64> {
    let mut weights = HashMap::new();
    if voters.is_empty() || k == 0 {
        return weights;
    }

    let mut stakes = Vec::with_capacity(voters.len());
    let mut total: u64 = 0;

    for voter in voters {
        let stake = read_stake(snapshot, voter)
            .ok()
            .flatten()
            .unwrap_or(0)
            .max(minimum_stake);
        stakes.push(stake);
        total += stake;
    }

    if total == 0 {
        return weights;
    }

    let scale = voters.len() as f64 / k as f64;
    for (voter, stake) in voters.iter().zip(stakes) {
        let weight = stake as f64 / total as f64 * scale;
        weights.insert(*voter, weight);
    }

    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_db::MemStore;

    fn account(byte: u8) -> AccountId {
        AccountId::from_bytes([byte; 32])
    }

    fn snapshot_with_stakes(stakes: &[(AccountId, u64)]) -> Tree {
        let mut tree = Tree::new(Arc::new(MemStore::new())).unwrap();
        for (account, stake) in stakes {
            write_stake(&mut tree, account, *stake).unwrap();
        }
        tree
    }

    #[test]
    fn test_projections_roundtrip() {
        let mut tree = Tree::new(Arc::new(MemStore::new())).unwrap();
        let alice = account(1);

        write_balance(&mut tree, &alice, 500).unwrap();
        write_stake(&mut tree, &alice, 200).unwrap();
        write_nonce(&mut tree, &alice, 3).unwrap();
        write_contract_code(&mut tree, &alice, b"\0asm").unwrap();

        assert_eq!(read_balance(&tree, &alice).unwrap(), Some(500));
        assert_eq!(read_stake(&tree, &alice).unwrap(), Some(200));
        assert_eq!(read_nonce(&tree, &alice).unwrap(), Some(3));
        assert_eq!(
            read_contract_code(&tree, &alice).unwrap(),
            Some(b"\0asm".to_vec())
        );

        let bob = account(2);
        assert_eq!(read_balance(&tree, &bob).unwrap(), None);
    }

    #[test]
    fn test_projections_do_not_collide() {
        let mut tree = Tree::new(Arc::new(MemStore::new())).unwrap();
        let alice = account(1);

        write_balance(&mut tree, &alice, 1).unwrap();
        write_stake(&mut tree, &alice, 2).unwrap();
        write_nonce(&mut tree, &alice, 3).unwrap();

        assert_eq!(read_balance(&tree, &alice).unwrap(), Some(1));
        assert_eq!(read_stake(&tree, &alice).unwrap(), Some(2));
        assert_eq!(read_nonce(&tree, &alice).unwrap(), Some(3));
    }

    #[test]
    fn test_accounts_commit_swaps_state() {
        let store = Arc::new(MemStore::new());
        let accounts = Accounts::new(store.clone()).unwrap();

        let mut snapshot = accounts.snapshot();
        write_balance(&mut snapshot, &account(1), 42).unwrap();
        let staged = snapshot.checksum();

        assert_ne!(accounts.checksum(), staged);
        accounts.commit(Some(snapshot)).unwrap();
        assert_eq!(accounts.checksum(), staged);

        // The committed state survives a reopen.
        let reopened = Accounts::new(store).unwrap();
        assert_eq!(reopened.checksum(), staged);
    }

    #[test]
    fn test_stake_distribution_full_quorum_sums_to_one() {
        let voters = [account(1), account(2), account(3), account(4)];
        let snapshot = snapshot_with_stakes(&[
            (voters[0], 100),
            (voters[1], 100),
            (voters[2], 100),
            (voters[3], 100),
        ]);

        let weights = compute_stake_distribution(&snapshot, &voters, 4, 100);
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stake_distribution_weighs_by_stake() {
        let heavy = account(1);
        let light = account(2);
        let snapshot = snapshot_with_stakes(&[(heavy, 300), (light, 100)]);

        let weights = compute_stake_distribution(&snapshot, &[heavy, light], 2, 100);
        assert!(weights[&heavy] > weights[&light]);
        assert!((weights[&heavy] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_stake_distribution_floors_idle_validators() {
        let idle = account(1);
        let snapshot = snapshot_with_stakes(&[]);

        let weights = compute_stake_distribution(&snapshot, &[idle], 1, 100);
        assert!((weights[&idle] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stake_distribution_partial_response_shrinks() {
        let voters = [account(1), account(2)];
        let snapshot = snapshot_with_stakes(&[(voters[0], 100), (voters[1], 100)]);

        // Only 2 of the 4 sampled peers answered.
        let weights = compute_stake_distribution(&snapshot, &voters, 4, 100);
        let total: f64 = weights.values().sum();
        assert!((total - 0.5).abs() < 1e-9);
    }
}
