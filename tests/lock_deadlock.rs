//! Cross-thread lock behavior: the classic two-key deadlock, waiter
//! fairness, and mutual exclusion through the tree API.

use std::sync::Arc;
use std::time::Duration;

use burrowdb::{Database, Error, LockResult};

#[test]
fn two_thread_deadlock_names_one_victim() {
    let db = Database::builder().page_size(4096).open_memory().unwrap();

    let mut a = db.new_locker();
    let mut b = db.new_locker();

    a.lock_exclusive(1, b"a", 500_000_000).unwrap();
    b.lock_exclusive(1, b"b", 500_000_000).unwrap();

    // Thread B requests "a" with a generous timeout; the main thread
    // requests "b" with 500ms and must be told about the cycle.
    let b_thread = std::thread::spawn(move || {
        let r = b.lock_exclusive(1, b"a", 3_000_000_000);
        (b, r)
    });

    std::thread::sleep(Duration::from_millis(100));
    let err = a
        .lock_exclusive(1, b"b", 500_000_000)
        .expect_err("cycle must surface");
    let info = match err.downcast_ref::<Error>() {
        Some(Error::Deadlock(info)) => info,
        other => panic!("expected deadlock, got {:?}", other),
    };
    assert_eq!(info.locks.len(), 2, "cycle spans both keys");
    assert!(info
        .locks
        .iter()
        .any(|(_, k)| k == b"a" || k == b"b"));

    // The victim resets; the survivor then acquires.
    a.scope_exit_all().unwrap();
    let (mut b, r) = b_thread.join().unwrap();
    assert!(r.is_ok(), "survivor should acquire after victim reset: {r:?}");
    b.scope_exit_all().unwrap();
}

#[test]
fn incompatible_locks_never_coexist() {
    let db = Database::builder().page_size(4096).open_memory().unwrap();

    let mut a = db.new_locker();
    let mut b = db.new_locker();

    a.lock_exclusive(9, b"key", 1_000_000_000).unwrap();
    for attempt in [
        b.try_lock_shared(9, b"key", 0).unwrap(),
        b.try_lock_upgradable(9, b"key", 0).unwrap(),
        b.try_lock_exclusive(9, b"key", 0).unwrap(),
    ] {
        assert_eq!(attempt, LockResult::TimedOutLock);
        b.clear_waiting_for();
    }

    a.unlock_to_shared().unwrap();
    assert_eq!(
        b.try_lock_shared(9, b"key", 0).unwrap(),
        LockResult::Acquired
    );
    a.scope_exit_all().unwrap();
    b.scope_exit_all().unwrap();
}

#[test]
fn writer_blocks_writer_until_commit() {
    let db = Database::builder()
        .page_size(4096)
        .lock_timeout_nanos(2_000_000_000)
        .open_memory()
        .unwrap();
    let tree = db.create_tree().unwrap();
    tree.store(None, b"k", b"init").unwrap();

    let mut txn = db.begin().unwrap();
    tree.store(Some(&mut txn), b"k", b"first").unwrap();

    let handle = {
        let db = Arc::clone(&db);
        let tree = Arc::clone(&tree);
        std::thread::spawn(move || {
            // Blocks until the first transaction commits.
            tree.store(None, b"k", b"second").unwrap();
            let _ = db;
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    // Still our value: the other writer is parked on the lock.
    assert_eq!(
        tree.load(Some(&mut txn), b"k").unwrap(),
        Some(b"first".to_vec())
    );

    txn.commit().unwrap();
    handle.join().unwrap();
    assert_eq!(tree.load(None, b"k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn interrupted_waiter_reports_interruption() {
    let db = Database::builder().page_size(4096).open_memory().unwrap();
    let mut a = db.new_locker();
    let mut b = db.new_locker();

    a.lock_exclusive(1, b"k", 1_000_000_000).unwrap();

    let owner = Arc::clone(b.owner_handle());
    let handle = std::thread::spawn(move || {
        let err = b.lock_exclusive(1, b"k", -1).unwrap_err();
        matches!(err.downcast_ref::<Error>(), Some(Error::LockInterrupted))
    });

    std::thread::sleep(Duration::from_millis(100));
    owner.interrupt();
    assert!(handle.join().unwrap(), "waiter must report interruption");
    a.scope_exit_all().unwrap();
}
