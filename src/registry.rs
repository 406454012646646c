//! The wallet registry: address → ledger, with per-wallet serialization.
//!
//! The registry index is shared and cheap to read; each wallet owns its own
//! FIFO-fair lock, so commands against different wallets run in parallel
//! while commands against one wallet execute in arrival order. A mutation
//! that panics poisons only its wallet; the rest of the enclave keeps
//! serving.

use dashmap::DashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::keystore::{KeyManager, KeystoreError};
use crate::ledger::WalletLedger;
use crate::types::EvmAddress;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown wallet: {0}")]
    UnknownWallet(EvmAddress),
    #[error("timed out waiting for wallet {0}")]
    Timeout(EvmAddress),
    #[error("fatal wallet error: {0} is poisoned")]
    Poisoned(EvmAddress),
    #[error(transparent)]
    Kms(#[from] KeystoreError),
}

struct WalletCell {
    lock: tokio::sync::Mutex<WalletLedger>,
    poisoned: AtomicBool,
}

/// Shared index of all wallets hosted by this enclave.
pub struct WalletRegistry {
    keystore: Arc<KeyManager>,
    wallets: DashMap<EvmAddress, Arc<WalletCell>>,
    order: Mutex<Vec<EvmAddress>>,
    lock_wait: Duration,
}

impl WalletRegistry {
    pub fn new(keystore: Arc<KeyManager>, lock_wait: Duration) -> Self {
        Self {
            keystore,
            wallets: DashMap::new(),
            order: Mutex::new(Vec::new()),
            lock_wait,
        }
    }

    /// Creates a wallet: asks the key manager for a fresh address and
    /// installs an empty ledger behind it.
    pub fn create(&self, name: String, owner: String) -> Result<EvmAddress, RegistryError> {
        let address = self.keystore.generate_account()?;
        let ledger = WalletLedger::new(address, name, owner);
        self.wallets.insert(
            address,
            Arc::new(WalletCell {
                lock: tokio::sync::Mutex::new(ledger),
                poisoned: AtomicBool::new(false),
            }),
        );
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(address);
        tracing::info!(wallet = %address, "wallet created");
        Ok(address)
    }

    /// Wallet addresses in creation order.
    pub fn list(&self) -> Vec<EvmAddress> {
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs `f` under the wallet's exclusive lock.
    ///
    /// This is the sole path to a wallet's state. The lock is FIFO-fair;
    /// waiting is bounded by the configured lock-wait, after which the call
    /// returns [`RegistryError::Timeout`] without touching state. A panic
    /// inside `f` poisons the wallet permanently.
    pub async fn with_wallet<T, F>(&self, address: EvmAddress, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut WalletLedger) -> T + Send,
        T: Send,
    {
        let cell = self
            .wallets
            .get(&address)
            .ok_or(RegistryError::UnknownWallet(address))?
            .value()
            .clone();
        if cell.poisoned.load(Ordering::Acquire) {
            return Err(RegistryError::Poisoned(address));
        }
        let mut guard = tokio::time::timeout(self.lock_wait, cell.lock.lock())
            .await
            .map_err(|_| RegistryError::Timeout(address))?;
        if cell.poisoned.load(Ordering::Acquire) {
            return Err(RegistryError::Poisoned(address));
        }
        match panic::catch_unwind(AssertUnwindSafe(|| f(&mut guard))) {
            Ok(value) => Ok(value),
            Err(_) => {
                cell.poisoned.store(true, Ordering::Release);
                tracing::error!(wallet = %address, "wallet mutation panicked; wallet poisoned");
                Err(RegistryError::Poisoned(address))
            }
        }
    }
}
