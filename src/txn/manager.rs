//! Transaction registry
//!
//! The `TransactionManager` maps transaction ids to live [`Transaction`]s and
//! allocates fresh ids. It is constructed explicitly and shared through an
//! `Arc`, never held in a global.
//!
//! ## Locking
//! The registry has its own `RwLock`, separate from every transaction's lock.
//! It is held only for a map lookup, insert, or remove; callers clone the
//! `Arc<Transaction>` out and release the registry before taking the
//! transaction's lock. A slow durable write on one transaction therefore never
//! blocks lookups or progress on any other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{DfsError, Result};
use super::recovery::RecoveredState;
use super::types::{Transaction, TxnId, TxnState};

/// The Transaction Manager
pub struct TransactionManager {
    /// Registered transactions (txn_id -> Transaction)
    txns: RwLock<HashMap<TxnId, Arc<Transaction>>>,
    /// Next transaction ID to hand out
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            txns: RwLock::new(HashMap::new()),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// Build a registry from a replayed recovery log
    pub fn from_recovered(state: RecoveredState) -> Self {
        let manager = Self::new();
        manager.restore(state);
        manager
    }

    /// Register every transaction the recovery log knows about.
    ///
    /// Terminal transactions are kept so that a client retrying COMMIT or
    /// ABORT after a restart still gets the answer it missed.
    pub fn restore(&self, state: RecoveredState) {
        self.next_txn_id.fetch_max(state.next_txn_id, Ordering::SeqCst);

        let mut txns = self.txns.write().expect("transaction registry lock poisoned");
        for (txn_id, recovered) in state.transactions {
            let txn_state = TxnState::restored(recovered.status, recovered.fragments);
            txns.insert(
                txn_id,
                Arc::new(Transaction::with_state(txn_id, recovered.file_name, txn_state)),
            );
        }
    }

    /// Allocate a transaction id that has never been handed out
    pub fn allocate_id(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a fully constructed transaction.
    ///
    /// Fails if the id is already taken; the existing entry is left untouched.
    pub fn register(&self, txn: Transaction) -> Result<Arc<Transaction>> {
        let txn_id = txn.id();
        let mut txns = self.txns.write().expect("transaction registry lock poisoned");
        if txns.contains_key(&txn_id) {
            return Err(DfsError::Internal(format!(
                "Transaction {} is already registered",
                txn_id
            )));
        }
        let txn = Arc::new(txn);
        txns.insert(txn_id, Arc::clone(&txn));
        // Keep allocation ahead of ids registered from outside
        self.next_txn_id.fetch_max(txn_id.saturating_add(1), Ordering::SeqCst);
        Ok(txn)
    }

    /// Allocate an id and register a new ACTIVE transaction for `file_name`
    pub fn begin(&self, file_name: &str) -> Result<Arc<Transaction>> {
        let txn_id = self.allocate_id();
        self.register(Transaction::new(txn_id, file_name))
    }

    pub fn lookup(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        let txns = self.txns.read().expect("transaction registry lock poisoned");
        txns.get(&txn_id).cloned()
    }

    /// Remove a transaction from the registry.
    ///
    /// Callers that already hold the `Arc` from an earlier lookup keep a valid
    /// transaction; they just can no longer find it by id.
    pub fn remove(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        let mut txns = self.txns.write().expect("transaction registry lock poisoned");
        txns.remove(&txn_id)
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        let txns = self.txns.read().expect("transaction registry lock poisoned");
        txns.contains_key(&txn_id)
    }

    pub fn len(&self) -> usize {
        self.txns.read().expect("transaction registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered transaction ids, ascending
    pub fn ids(&self) -> Vec<TxnId> {
        let txns = self.txns.read().expect("transaction registry lock poisoned");
        let mut ids: Vec<TxnId> = txns.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
