use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionState,
};
use crate::transaction::concurrency::wait_for_graph::WaitForGraph;

const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    shared_count: usize,
    exclusive_count: usize,
    upgrading: bool,
    cv: Arc<Condvar>,
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        Self {
            requests: VecDeque::new(),
            shared_count: 0,
            exclusive_count: 0,
            upgrading: false,
            cv: Arc::new(Condvar::new()),
        }
    }
}

struct LockTable {
    queues: HashMap<Rid, LockRequestQueue>,
    transactions: HashMap<TxnId, Arc<Transaction>>,
}

struct LockManagerCore {
    latch: Mutex<LockTable>,
}

/// Record-level lock manager enforcing two-phase locking.
///
/// Requests queue FIFO per record; grants are mode-compatible, with a
/// waiting exclusive request blocking later shared grants so writers cannot
/// starve. Waiters park on a per-record condition variable and are woken by
/// releases and by the background deadlock detector, which aborts the
/// youngest transaction of any waits-for cycle.
pub struct LockManager {
    core: Arc<LockManagerCore>,
    running: Arc<AtomicBool>,
    detector: Option<JoinHandle<()>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_detection_interval(DEFAULT_DETECTION_INTERVAL)
    }

    pub fn with_detection_interval(interval: Duration) -> Self {
        let core = Arc::new(LockManagerCore {
            latch: Mutex::new(LockTable {
                queues: HashMap::new(),
                transactions: HashMap::new(),
            }),
        });
        let running = Arc::new(AtomicBool::new(true));

        let detector = {
            let core = core.clone();
            let running = running.clone();
            let spawned = thread::Builder::new()
                .name("deadlock-detector".into())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        thread::sleep(interval);
                        let mut table = core.latch.lock();
                        Self::run_detection(&mut table);
                    }
                });
            match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("failed to spawn deadlock detector: {}", e);
                    None
                }
            }
        };

        Self {
            core,
            running,
            detector,
        }
    }

    /// Take a shared lock on `rid`, blocking while an exclusive holder or an
    /// earlier exclusive waiter exists.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<(), TransactionError> {
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionError::Aborted {
                txn_id: txn.id(),
                reason: AbortReason::LockSharedOnReadUncommitted,
            });
        }
        if txn.state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionError::Aborted {
                txn_id: txn.id(),
                reason: AbortReason::LockOnShrinking,
            });
        }

        let mut table = self.core.latch.lock();
        table
            .transactions
            .entry(txn.id())
            .or_insert_with(|| txn.clone());
        let queue = table.queues.entry(rid).or_default();
        queue.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode: LockMode::Shared,
            granted: false,
        });

        loop {
            if txn.state() == TransactionState::Aborted {
                Self::abandon_request(&mut table, txn.id(), rid);
                return Err(TransactionError::Aborted {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }

            let granted = {
                let queue = Self::queue_mut(&mut table, rid)?;
                if Self::shared_grantable(queue, txn.id()) {
                    Self::mark_granted(queue, txn.id());
                    queue.shared_count += 1;
                    true
                } else {
                    false
                }
            };
            if granted {
                break;
            }

            let cv = Self::queue_mut(&mut table, rid)?.cv.clone();
            cv.wait(&mut table);
        }
        drop(table);

        txn.shared_lock_set().insert(rid);
        Ok(())
    }

    /// Take an exclusive lock on `rid`, blocking while any other holder
    /// exists or an earlier request is still queued.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionError::Aborted {
                txn_id: txn.id(),
                reason: AbortReason::LockOnShrinking,
            });
        }

        let mut table = self.core.latch.lock();
        table
            .transactions
            .entry(txn.id())
            .or_insert_with(|| txn.clone());
        let queue = table.queues.entry(rid).or_default();
        queue.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode: LockMode::Exclusive,
            granted: false,
        });

        loop {
            if txn.state() == TransactionState::Aborted {
                Self::abandon_request(&mut table, txn.id(), rid);
                return Err(TransactionError::Aborted {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }

            let granted = {
                let queue = Self::queue_mut(&mut table, rid)?;
                if Self::exclusive_grantable(queue, txn.id()) {
                    Self::mark_granted(queue, txn.id());
                    queue.exclusive_count += 1;
                    true
                } else {
                    false
                }
            };
            if granted {
                break;
            }

            let cv = Self::queue_mut(&mut table, rid)?.cv.clone();
            cv.wait(&mut table);
        }
        drop(table);

        txn.exclusive_lock_set().insert(rid);
        Ok(())
    }

    /// Upgrade a held shared lock to exclusive. At most one transaction may
    /// be upgrading a given record at a time; a second upgrader aborts.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionError::Aborted {
                txn_id: txn.id(),
                reason: AbortReason::LockOnShrinking,
            });
        }

        let mut table = self.core.latch.lock();
        let queue = table
            .queues
            .get_mut(&rid)
            .ok_or(TransactionError::LockNotHeld(txn.id(), rid))?;
        if queue.upgrading {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionError::Aborted {
                txn_id: txn.id(),
                reason: AbortReason::UpgradeConflict,
            });
        }

        let request = queue
            .requests
            .iter_mut()
            .find(|r| r.txn_id == txn.id())
            .ok_or(TransactionError::LockNotHeld(txn.id(), rid))?;
        if request.mode != LockMode::Shared || !request.granted {
            return Err(TransactionError::LockNotHeld(txn.id(), rid));
        }

        // Swap the granted shared request for a waiting exclusive one.
        request.mode = LockMode::Exclusive;
        request.granted = false;
        queue.shared_count -= 1;
        queue.upgrading = true;
        txn.shared_lock_set().remove(&rid);

        loop {
            if txn.state() == TransactionState::Aborted {
                if let Some(queue) = table.queues.get_mut(&rid) {
                    queue.upgrading = false;
                }
                Self::abandon_request(&mut table, txn.id(), rid);
                return Err(TransactionError::Aborted {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }

            let granted = {
                let queue = Self::queue_mut(&mut table, rid)?;
                if queue.shared_count == 0 && queue.exclusive_count == 0 {
                    Self::mark_granted(queue, txn.id());
                    queue.exclusive_count += 1;
                    queue.upgrading = false;
                    true
                } else {
                    false
                }
            };
            if granted {
                break;
            }

            let cv = Self::queue_mut(&mut table, rid)?.cv.clone();
            cv.wait(&mut table);
        }
        drop(table);

        txn.exclusive_lock_set().insert(rid);
        Ok(())
    }

    /// Release a held lock, applying the two-phase transition: any release
    /// under REPEATABLE READ moves the transaction to its shrinking phase,
    /// as does an exclusive release under the weaker levels. Shared releases
    /// under READ COMMITTED are 2PL-exempt.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<(), TransactionError> {
        let mut table = self.core.latch.lock();

        let was_shared = txn.shared_lock_set().remove(&rid);
        let was_exclusive = txn.exclusive_lock_set().remove(&rid);
        if !was_shared && !was_exclusive {
            return Err(TransactionError::LockNotHeld(txn.id(), rid));
        }

        if txn.state() == TransactionState::Growing
            && (txn.isolation_level() == IsolationLevel::RepeatableRead || was_exclusive)
        {
            txn.set_state(TransactionState::Shrinking);
        }

        let queue = Self::queue_mut(&mut table, rid)?;
        if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn.id()) {
            queue.requests.remove(pos);
        }
        if was_shared {
            queue.shared_count = queue.shared_count.saturating_sub(1);
            if queue.shared_count == 0 {
                queue.cv.notify_all();
            }
        }
        if was_exclusive {
            queue.exclusive_count = queue.exclusive_count.saturating_sub(1);
            queue.cv.notify_all();
        }

        Ok(())
    }

    /// Drop every lock a transaction holds, without 2PL transitions. Used by
    /// commit and abort processing.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let mut table = self.core.latch.lock();

        let shared: Vec<Rid> = txn.shared_lock_set().drain().collect();
        let exclusive: Vec<Rid> = txn.exclusive_lock_set().drain().collect();

        for rid in shared {
            if let Some(queue) = table.queues.get_mut(&rid) {
                if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn.id()) {
                    queue.requests.remove(pos);
                }
                queue.shared_count = queue.shared_count.saturating_sub(1);
                if queue.shared_count == 0 {
                    queue.cv.notify_all();
                }
            }
        }
        for rid in exclusive {
            if let Some(queue) = table.queues.get_mut(&rid) {
                if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn.id()) {
                    queue.requests.remove(pos);
                }
                queue.exclusive_count = queue.exclusive_count.saturating_sub(1);
                queue.cv.notify_all();
            }
        }

        table.transactions.remove(&txn.id());
    }

    /// Rebuild the waits-for graph from the lock table and abort the
    /// youngest member of every cycle, waking its waiters so they can
    /// unwind.
    fn run_detection(table: &mut LockTable) {
        let mut graph = WaitForGraph::new();
        for queue in table.queues.values() {
            for waiter in queue.requests.iter().filter(|r| !r.granted) {
                for holder in queue.requests.iter().filter(|r| r.granted) {
                    graph.add_edge(waiter.txn_id, holder.txn_id);
                }
            }
        }

        while let Some(cycle) = graph.find_cycle() {
            let Some(&victim) = cycle.iter().max() else {
                break;
            };
            debug!(
                "deadlock cycle {:?} detected, aborting youngest transaction {}",
                cycle, victim
            );
            if let Some(txn) = table.transactions.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            graph.remove_transaction(victim);
            for queue in table.queues.values() {
                if queue.requests.iter().any(|r| r.txn_id == victim) {
                    queue.cv.notify_all();
                }
            }
        }
    }

    /// Shared requests are compatible with everything granted before them
    /// except an exclusive holder, and must not overtake a waiting
    /// exclusive.
    fn shared_grantable(queue: &LockRequestQueue, txn_id: TxnId) -> bool {
        if queue.exclusive_count > 0 || queue.upgrading {
            return false;
        }
        for request in &queue.requests {
            if request.txn_id == txn_id {
                return true;
            }
            if request.mode == LockMode::Exclusive {
                return false;
            }
        }
        false
    }

    /// An exclusive request needs the record idle and must be the first
    /// request in line.
    fn exclusive_grantable(queue: &LockRequestQueue, txn_id: TxnId) -> bool {
        queue.shared_count == 0
            && queue.exclusive_count == 0
            && !queue.upgrading
            && queue.requests.front().map_or(false, |r| r.txn_id == txn_id)
    }

    fn mark_granted(queue: &mut LockRequestQueue, txn_id: TxnId) {
        if let Some(request) = queue.requests.iter_mut().find(|r| r.txn_id == txn_id) {
            request.granted = true;
        }
    }

    /// A waiter that aborts removes its own request before unwinding.
    fn abandon_request(table: &mut LockTable, txn_id: TxnId, rid: Rid) {
        if let Some(queue) = table.queues.get_mut(&rid) {
            if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn_id) {
                queue.requests.remove(pos);
            }
            queue.cv.notify_all();
        }
    }

    fn queue_mut(
        table: &mut LockTable,
        rid: Rid,
    ) -> Result<&mut LockRequestQueue, TransactionError> {
        table
            .queues
            .get_mut(&rid)
            .ok_or_else(|| TransactionError::Internal(format!("lock queue for {} vanished", rid)))
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.detector.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: TxnId, isolation: IsolationLevel) -> Arc<Transaction> {
        Arc::new(Transaction::new(id, isolation))
    }

    #[test]
    fn test_shared_then_unlock() {
        let lm = LockManager::new();
        let t1 = txn(1, IsolationLevel::RepeatableRead);
        let rid = Rid::new(1, 0);

        lm.lock_shared(&t1, rid).unwrap();
        assert!(t1.holds_shared(&rid));
        assert_eq!(t1.state(), TransactionState::Growing);

        lm.unlock(&t1, rid).unwrap();
        assert!(!t1.holds_shared(&rid));
        assert_eq!(t1.state(), TransactionState::Shrinking);
    }

    #[test]
    fn test_shared_lock_forbidden_under_read_uncommitted() {
        let lm = LockManager::new();
        let t1 = txn(1, IsolationLevel::ReadUncommitted);
        let rid = Rid::new(1, 0);

        let err = lm.lock_shared(&t1, rid).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Aborted {
                txn_id: 1,
                reason: AbortReason::LockSharedOnReadUncommitted
            }
        ));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_lock_on_shrinking_aborts() {
        let lm = LockManager::new();
        let t1 = txn(1, IsolationLevel::RepeatableRead);
        let rid = Rid::new(1, 0);

        lm.lock_shared(&t1, rid).unwrap();
        lm.unlock(&t1, rid).unwrap();
        assert_eq!(t1.state(), TransactionState::Shrinking);

        let err = lm.lock_shared(&t1, rid).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Aborted {
                reason: AbortReason::LockOnShrinking,
                ..
            }
        ));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_read_committed_keeps_growing_after_shared_release() {
        let lm = LockManager::new();
        let t1 = txn(1, IsolationLevel::ReadCommitted);
        let r1 = Rid::new(1, 0);
        let r2 = Rid::new(1, 1);

        lm.lock_shared(&t1, r1).unwrap();
        lm.unlock(&t1, r1).unwrap();
        assert_eq!(t1.state(), TransactionState::Growing);

        // Reads stay 2PL-exempt, writes do not.
        lm.lock_exclusive(&t1, r2).unwrap();
        lm.unlock(&t1, r2).unwrap();
        assert_eq!(t1.state(), TransactionState::Shrinking);
    }

    #[test]
    fn test_multiple_shared_holders() {
        let lm = LockManager::new();
        let t1 = txn(1, IsolationLevel::RepeatableRead);
        let t2 = txn(2, IsolationLevel::RepeatableRead);
        let rid = Rid::new(1, 0);

        lm.lock_shared(&t1, rid).unwrap();
        lm.lock_shared(&t2, rid).unwrap();
        assert!(t1.holds_shared(&rid));
        assert!(t2.holds_shared(&rid));
    }

    #[test]
    fn test_upgrade_without_shared_lock_fails() {
        let lm = LockManager::new();
        let t1 = txn(1, IsolationLevel::RepeatableRead);
        let rid = Rid::new(1, 0);

        assert!(matches!(
            lm.lock_upgrade(&t1, rid),
            Err(TransactionError::LockNotHeld(1, _))
        ));
    }

    #[test]
    fn test_uncontended_upgrade() {
        let lm = LockManager::new();
        let t1 = txn(1, IsolationLevel::RepeatableRead);
        let rid = Rid::new(1, 0);

        lm.lock_shared(&t1, rid).unwrap();
        lm.lock_upgrade(&t1, rid).unwrap();
        assert!(!t1.holds_shared(&rid));
        assert!(t1.holds_exclusive(&rid));

        lm.unlock(&t1, rid).unwrap();
        assert!(!t1.holds_exclusive(&rid));
    }

    #[test]
    fn test_unlock_without_lock_fails() {
        let lm = LockManager::new();
        let t1 = txn(1, IsolationLevel::RepeatableRead);
        assert!(matches!(
            lm.unlock(&t1, Rid::new(9, 9)),
            Err(TransactionError::LockNotHeld(1, _))
        ));
    }
}
