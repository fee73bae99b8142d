use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use keeldb::common::types::Rid;
use keeldb::transaction::{
    AbortReason, IsolationLevel, LockManager, TransactionError, TransactionManager,
    TransactionState,
};

fn setup() -> (Arc<LockManager>, TransactionManager) {
    let lm = Arc::new(LockManager::with_detection_interval(Duration::from_millis(10)));
    let tm = TransactionManager::new(lm.clone());
    (lm, tm)
}

#[test]
fn test_exclusive_blocks_until_shared_released() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lm.lock_shared(&t1, rid)?;

    let granted = AtomicBool::new(false);
    thread::scope(|s| {
        let handle = s.spawn(|| {
            lm.lock_exclusive(&t2, rid).unwrap();
            granted.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!granted.load(Ordering::SeqCst), "exclusive granted too early");

        lm.unlock(&t1, rid).unwrap();
        handle.join().unwrap();
    });
    assert!(granted.load(Ordering::SeqCst));
    assert!(t2.holds_exclusive(&rid));

    tm.commit(&t2)?;
    tm.commit(&t1)?;
    Ok(())
}

#[test]
fn test_pending_exclusive_blocks_later_shared() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let t3 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lm.lock_shared(&t1, rid)?;

    let writer_granted = AtomicBool::new(false);
    let reader_granted = AtomicBool::new(false);
    thread::scope(|s| {
        let writer = s.spawn(|| {
            lm.lock_exclusive(&t2, rid).unwrap();
            writer_granted.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            lm.unlock(&t2, rid).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        let reader = s.spawn(|| {
            lm.lock_shared(&t3, rid).unwrap();
            reader_granted.store(true, Ordering::SeqCst);
        });

        // The reader arrived behind a waiting writer and must not overtake
        // it.
        thread::sleep(Duration::from_millis(100));
        assert!(!writer_granted.load(Ordering::SeqCst));
        assert!(
            !reader_granted.load(Ordering::SeqCst),
            "shared lock overtook a waiting exclusive"
        );

        lm.unlock(&t1, rid).unwrap();
        writer.join().unwrap();
        reader.join().unwrap();
    });

    assert!(writer_granted.load(Ordering::SeqCst));
    assert!(reader_granted.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_shared_batch_granted_together() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let t3 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lm.lock_exclusive(&t1, rid)?;

    thread::scope(|s| {
        let a = s.spawn(|| lm.lock_shared(&t2, rid));
        let b = s.spawn(|| lm.lock_shared(&t3, rid));

        thread::sleep(Duration::from_millis(50));
        lm.unlock(&t1, rid).unwrap();

        a.join().unwrap().unwrap();
        b.join().unwrap().unwrap();
    });

    assert!(t2.holds_shared(&rid));
    assert!(t3.holds_shared(&rid));
    Ok(())
}

#[test]
fn test_two_phase_violation_aborts() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lm.lock_shared(&t1, rid)?;
    lm.unlock(&t1, rid)?;
    assert_eq!(t1.state(), TransactionState::Shrinking);

    let err = lm.lock_shared(&t1, rid).unwrap_err();
    assert!(matches!(
        err,
        TransactionError::Aborted {
            reason: AbortReason::LockOnShrinking,
            ..
        }
    ));
    tm.abort(&t1)?;
    Ok(())
}

#[test]
fn test_upgrade_waits_for_other_readers() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lm.lock_shared(&t1, rid)?;
    lm.lock_shared(&t2, rid)?;

    let upgraded = AtomicBool::new(false);
    thread::scope(|s| {
        let handle = s.spawn(|| {
            lm.lock_upgrade(&t1, rid).unwrap();
            upgraded.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!upgraded.load(Ordering::SeqCst), "upgrade granted too early");

        lm.unlock(&t2, rid).unwrap();
        handle.join().unwrap();
    });

    assert!(t1.holds_exclusive(&rid));
    assert!(!t1.holds_shared(&rid));
    Ok(())
}

#[test]
fn test_concurrent_upgrades_conflict() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    lm.lock_shared(&t1, rid)?;
    lm.lock_shared(&t2, rid)?;

    thread::scope(|s| {
        // The first upgrader waits for the second reader.
        let handle = s.spawn(|| lm.lock_upgrade(&t1, rid));

        thread::sleep(Duration::from_millis(50));

        // The second upgrade request must abort immediately.
        let err = lm.lock_upgrade(&t2, rid).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Aborted {
                reason: AbortReason::UpgradeConflict,
                ..
            }
        ));
        assert_eq!(t2.state(), TransactionState::Aborted);

        // Aborting the loser releases its shared lock and unblocks the
        // winner.
        tm.abort(&t2).unwrap();
        handle.join().unwrap().unwrap();
    });

    assert!(t1.holds_exclusive(&rid));
    Ok(())
}

#[test]
fn test_deadlock_aborts_youngest() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    assert!(t1.id() < t2.id());
    let r1 = Rid::new(1, 0);
    let r2 = Rid::new(2, 0);

    lm.lock_exclusive(&t1, r1)?;
    lm.lock_exclusive(&t2, r2)?;

    thread::scope(|s| {
        let older = s.spawn(|| lm.lock_exclusive(&t1, r2));

        // Give the older transaction time to queue, then close the cycle.
        thread::sleep(Duration::from_millis(50));
        let err = lm.lock_exclusive(&t2, r1).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Aborted {
                reason: AbortReason::Deadlock,
                ..
            }
        ));
        assert_eq!(t2.state(), TransactionState::Aborted);

        // Rolling the victim back releases r2 and the survivor proceeds.
        tm.abort(&t2).unwrap();
        older.join().unwrap().unwrap();
    });

    assert!(t1.holds_exclusive(&r1));
    assert!(t1.holds_exclusive(&r2));
    tm.commit(&t1)?;
    Ok(())
}

#[test]
fn test_three_way_deadlock_resolves() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let t3 = tm.begin(IsolationLevel::RepeatableRead);
    let r1 = Rid::new(1, 0);
    let r2 = Rid::new(2, 0);
    let r3 = Rid::new(3, 0);

    lm.lock_exclusive(&t1, r1)?;
    lm.lock_exclusive(&t2, r2)?;
    lm.lock_exclusive(&t3, r3)?;

    thread::scope(|s| {
        let a = s.spawn(|| lm.lock_exclusive(&t1, r2));
        let b = s.spawn(|| lm.lock_exclusive(&t2, r3));
        thread::sleep(Duration::from_millis(50));

        // t3 -> r1 closes the cycle t1 -> t2 -> t3 -> t1; t3 is youngest.
        let err = lm.lock_exclusive(&t3, r1).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Aborted {
                reason: AbortReason::Deadlock,
                ..
            }
        ));
        tm.abort(&t3).unwrap();

        // t2 acquires r3, then finishes so t1 can take r2 in turn.
        b.join().unwrap().unwrap();
        tm.commit(&t2).unwrap();
        a.join().unwrap().unwrap();
    });

    tm.commit(&t1)?;
    Ok(())
}

#[test]
fn test_read_committed_shared_release_keeps_growing() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::ReadCommitted);
    let r1 = Rid::new(1, 0);
    let r2 = Rid::new(1, 1);

    lm.lock_shared(&t1, r1)?;
    lm.unlock(&t1, r1)?;
    assert_eq!(t1.state(), TransactionState::Growing);

    // A later lock is still legal.
    lm.lock_shared(&t1, r2)?;
    tm.commit(&t1)?;
    Ok(())
}
