//! Local wallet over the node's keypair and store.
//!
//! The wallet tracks its own nonce under the reserved `wallet_nonce_` key
//! prefix, reconciling against the committed account nonce so that a node
//! restarted from an older store does not reuse nonces.

use std::sync::Arc;

use parking_lot::Mutex;
use riptide_crypto::Keypair;
use riptide_db::Store;
use riptide_ids::AccountId;

use crate::accounts::{read_balance, read_nonce};
use crate::ledger::Ledger;
use crate::Result;

/// Store key prefix for the wallet's locally tracked nonce.
const KEY_WALLET_NONCE: &[u8] = b"wallet_nonce_";

/// A local wallet.
pub struct Wallet {
    keys: Keypair,
    store: Arc<dyn Store>,
    nonce_lock: Mutex<()>,
}

impl Wallet {
    /// Creates a wallet over the given keypair and store.
    #[must_use]
    pub fn new(keys: Keypair, store: Arc<dyn Store>) -> Self {
        Self {
            keys,
            store,
            nonce_lock: Mutex::new(()),
        }
    }

    /// The wallet's account.
    #[must_use]
    pub fn account(&self) -> AccountId {
        self.keys.account()
    }

    /// The wallet's keypair.
    #[must_use]
    pub fn keys(&self) -> &Keypair {
        &self.keys
    }

    fn nonce_key(&self) -> Vec<u8> {
        let mut key = KEY_WALLET_NONCE.to_vec();
        key.extend_from_slice(self.keys.account().as_bytes());
        key
    }

    /// The node's current knowledge of the wallet's nonce.
    ///
    /// # Errors
    ///
    /// Propagates store read errors.
    pub fn current_nonce(&self) -> Result<u64> {
        let bytes = self.store.get(&self.nonce_key())?;
        Ok(bytes
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0))
    }

    /// Claims the next available nonce, reconciling against the committed
    /// account state.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn next_nonce(&self, ledger: &Ledger) -> Result<u64> {
        let _guard = self.nonce_lock.lock();

        let mut nonce = self.current_nonce()?;

        // The committed ledger may be ahead of our local counter, e.g.
        // after a restore from a fresh store.
        let snapshot = ledger.snapshot();
        if let Some(committed) = read_nonce(&snapshot, &self.keys.account())? {
            if committed > nonce {
                nonce = committed;
            }
        }

        self.store
            .put(&self.nonce_key(), &(nonce + 1).to_le_bytes())?;

        Ok(nonce)
    }

    /// The wallet's committed balance.
    #[must_use]
    pub fn balance(&self, ledger: &Ledger) -> u64 {
        read_balance(&ledger.snapshot(), &self.keys.account())
            .ok()
            .flatten()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::GenesisAllocation;
    use crate::Config;
    use riptide_db::MemStore;

    fn setup() -> (Wallet, Arc<Ledger>) {
        let keys = Keypair::from_secret_bytes([1u8; 32]);
        let store = Arc::new(MemStore::new());

        let mut config = Config::default();
        config.genesis = vec![GenesisAllocation {
            account: keys.account(),
            balance: 5_000,
            stake: 100,
        }];

        let ledger = Ledger::new(keys.clone(), store.clone(), config).unwrap();
        (Wallet::new(keys, store), ledger)
    }

    #[test]
    fn test_nonce_starts_at_zero_and_increments() {
        let (wallet, ledger) = setup();

        assert_eq!(wallet.current_nonce().unwrap(), 0);
        assert_eq!(wallet.next_nonce(&ledger).unwrap(), 0);
        assert_eq!(wallet.next_nonce(&ledger).unwrap(), 1);
        assert_eq!(wallet.current_nonce().unwrap(), 2);
    }

    #[test]
    fn test_nonce_reconciles_with_committed_state() {
        let (wallet, ledger) = setup();

        // The committed account nonce ran ahead of the local counter.
        let mut snapshot = ledger.snapshot();
        crate::accounts::write_nonce(&mut snapshot, &wallet.account(), 7).unwrap();
        ledger.accounts.commit(Some(snapshot)).unwrap();

        assert_eq!(wallet.next_nonce(&ledger).unwrap(), 7);
        assert_eq!(wallet.next_nonce(&ledger).unwrap(), 8);
    }

    #[test]
    fn test_balance_reads_committed_state() {
        let (wallet, ledger) = setup();
        assert_eq!(wallet.balance(&ledger), 5_000);
    }
}
