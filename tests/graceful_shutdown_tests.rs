//! Graceful shutdown tests
//!
//! This test suite validates proper shutdown behavior:
//! - Clean shutdown while writers are active
//! - Close with an expiring or cancelled deadline
//! - Transactions refused once close has started
//! - No data loss on normal shutdown

use session_store::{ContextToken, Deadline, ReadableStore, Record, Store, StoreError, WALConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const TEST_COLLECTION: &str = "identityKeys";

// ============================================================================
// Clean Shutdown Tests
// ============================================================================

/// The store can be dropped right after writers stop and reopens with every
/// committed write
#[test]
fn test_clean_shutdown_during_writes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shutdown.db");

    let write_count = Arc::new(AtomicU64::new(0));
    let should_stop = Arc::new(AtomicBool::new(false));

    {
        let store = Arc::new(
            Store::builder()
                .checkpoint(WALConfig {
                    checkpoint_interval: Duration::from_millis(20),
                    max_wal_size: 2048,
                })
                .open(&path)
                .unwrap(),
        );

        let store_clone = Arc::clone(&store);
        let write_count_clone = Arc::clone(&write_count);
        let should_stop_clone = Arc::clone(&should_stop);

        let writer = thread::spawn(move || {
            let conn = store_clone.connection_for(ContextToken::new());
            while !should_stop_clone.load(Ordering::Relaxed) {
                let count = write_count_clone.load(Ordering::Relaxed);
                let mut txn = conn.begin_write().unwrap();
                txn.set(
                    TEST_COLLECTION,
                    &count.to_string(),
                    Record::new(0, b"test_value".to_vec()),
                )
                .unwrap();
                txn.commit().unwrap();
                write_count_clone.fetch_add(1, Ordering::Relaxed);

                thread::sleep(Duration::from_micros(100));
            }
        });

        thread::sleep(Duration::from_millis(150));
        should_stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();

        // Store drops here and closes itself
    }

    let final_count = write_count.load(Ordering::Relaxed);
    assert!(final_count > 0, "Should have written some data");

    let store = Store::open(&path).unwrap();
    let read = store.begin_read().unwrap();
    assert_eq!(read.count(TEST_COLLECTION) as u64, final_count);
    assert_eq!(read.sequence(), final_count);
}

/// Explicit close checkpoints and reports the final sequence
#[test]
fn test_close_reports_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("close.db");

    let store = Store::open(&path).unwrap();
    for i in 0..5 {
        store
            .connection()
            .write(|txn| txn.set(TEST_COLLECTION, &i.to_string(), Record::new(0, vec![i])))
            .unwrap();
    }
    let report = store.close(&Deadline::after(Duration::from_secs(5))).unwrap();
    assert!(report.checkpointed);
    assert_eq!(report.sequence, 5);

    let store = Store::open(&path).unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.checkpoint_seq, 5);
    assert_eq!(stats.wal_bytes, 512);
}

/// Handles outliving the store fail cleanly instead of writing to released
/// files
#[test]
fn test_transactions_refused_after_close() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("refused.db");

    let store = Store::builder()
        .without_background_checkpoint()
        .open(&path)
        .unwrap();
    let conn = store.connection_for(ContextToken::from_raw(3));
    conn.write(|txn| txn.set(TEST_COLLECTION, "k", Record::new(0, b"v".to_vec())))
        .unwrap();

    store.close(&Deadline::none()).unwrap();

    assert!(matches!(conn.begin_read(), Err(StoreError::Closed)));
    assert!(matches!(conn.begin_write(), Err(StoreError::Closed)));

    // The files are free for a new store
    let reopened = Store::open(&path).unwrap();
    assert!(reopened.begin_read().unwrap().contains(TEST_COLLECTION, "k"));
}

// ============================================================================
// Deadline Tests
// ============================================================================

/// A close that cannot get the write gate in time skips the checkpoint but
/// still leaves every commit recoverable
#[test]
fn test_close_deadline_skips_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("deadline.db");

    let store = Store::builder()
        .without_background_checkpoint()
        .open(&path)
        .unwrap();
    store
        .connection()
        .write(|txn| txn.set(TEST_COLLECTION, "committed", Record::new(0, b"1".to_vec())))
        .unwrap();

    // A writer on another thread holds the gate past the deadline
    let conn = store.connection_for(ContextToken::from_raw(9));
    let (held_tx, held_rx) = std::sync::mpsc::channel();
    let holder = thread::spawn(move || {
        let mut txn = conn.begin_write().unwrap();
        txn.set(TEST_COLLECTION, "late", Record::new(0, b"2".to_vec()))
            .unwrap();
        held_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(200));
        txn.commit()
    });
    held_rx.recv().unwrap();

    let report = store
        .close(&Deadline::after(Duration::from_millis(30)))
        .unwrap();
    assert!(!report.checkpointed);
    assert_eq!(report.sequence, 1);

    // The in-flight writer finds the files released
    assert!(matches!(holder.join().unwrap(), Err(StoreError::Closed)));

    let store = Store::open(&path).unwrap();
    let read = store.begin_read().unwrap();
    assert!(read.contains(TEST_COLLECTION, "committed"));
    assert!(!read.contains(TEST_COLLECTION, "late"));
}

/// A writer that commits while close waits for the gate is kept
#[test]
fn test_close_waits_for_active_writer() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("drain.db");

    let store = Store::builder()
        .without_background_checkpoint()
        .open(&path)
        .unwrap();

    let conn = store.connection_for(ContextToken::from_raw(4));
    let (held_tx, held_rx) = std::sync::mpsc::channel();
    let holder = thread::spawn(move || {
        let mut txn = conn.begin_write().unwrap();
        txn.set(TEST_COLLECTION, "in_flight", Record::new(0, b"x".to_vec()))
            .unwrap();
        held_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        txn.commit()
    });
    held_rx.recv().unwrap();

    let report = store.close(&Deadline::after(Duration::from_secs(5))).unwrap();
    assert_eq!(holder.join().unwrap().unwrap(), 1);
    assert!(report.checkpointed);
    assert_eq!(report.sequence, 1);

    let store = Store::open(&path).unwrap();
    assert!(
        store
            .begin_read()
            .unwrap()
            .contains(TEST_COLLECTION, "in_flight")
    );
}

/// Cancelling the deadline has the same effect as expiry
#[test]
fn test_cancelled_checkpoint() {
    let dir = TempDir::new().unwrap();
    let store = Store::builder()
        .without_background_checkpoint()
        .open(dir.path().join("cancel.db"))
        .unwrap();

    let conn = store.connection();
    let writer = conn.begin_write().unwrap();

    let deadline = Deadline::none();
    let canceller = deadline.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        canceller.cancel();
    });

    let err = store.checkpoint(&deadline).unwrap_err();
    assert!(matches!(err, StoreError::DeadlineExceeded(_)));
    handle.join().unwrap();
    drop(writer);

    assert!(store.checkpoint(&Deadline::none()).is_ok());
}

/// Resetting removes all state even with commits pending in the log
#[test]
fn test_reset_after_writes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reset.db");

    let store = Store::open(&path).unwrap();
    store
        .connection()
        .write(|txn| txn.set(TEST_COLLECTION, "k", Record::new(0, b"v".to_vec())))
        .unwrap();
    store.reset(&Deadline::none()).unwrap();

    assert!(!path.exists());
    let store = Store::open(&path).unwrap();
    assert_eq!(store.begin_read().unwrap().sequence(), 0);
}
