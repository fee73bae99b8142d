use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Creates and tracks transactions. Commit and abort both hand every held
/// record lock back to the lock manager; a deadlock victim's caller is
/// expected to catch the abort error and call [`TransactionManager::abort`]
/// so the victim's granted locks are released.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    active: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction. Ids are handed out in increasing order, so a
    /// later transaction is always the younger one.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active.lock().insert(txn_id, txn.clone());
        txn
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                return Err(TransactionError::InvalidState(txn.id()));
            }
            TransactionState::Growing | TransactionState::Shrinking => {}
        }

        self.lock_manager.release_all_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.active.lock().remove(&txn.id());
        Ok(())
    }

    /// Roll a transaction back. Aborting an already-aborted transaction is
    /// fine: that is the normal path for deadlock victims.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn.id()));
        }

        self.lock_manager.release_all_locks(txn);
        txn.set_state(TransactionState::Aborted);
        self.active.lock().remove(&txn.id());
        Ok(())
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active.lock().get(&txn_id).cloned()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active.lock().keys().copied().collect()
    }
}
