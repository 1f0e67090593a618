use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlite_dispatch::{
    Connection, ConnectionPool, DispatchError, PoolDelegate, TransactionKind, params,
};

fn file_pool(dir: &tempfile::TempDir, max_size: usize) -> ConnectionPool {
    ConnectionPool::builder(dir.path().join("pool.db"))
        .max_size(max_size)
        .build()
}

#[tokio::test]
async fn connections_are_reused_after_release() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir, 4);

    let guard = pool.acquire().await.unwrap();
    guard.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
    assert_eq!(pool.checked_out_count(), 1);
    assert_eq!(pool.checked_in_count(), 0);
    drop(guard);
    assert_eq!(pool.checked_out_count(), 0);
    assert_eq!(pool.checked_in_count(), 1);

    let guard = pool.acquire().await.unwrap();
    guard
        .execute_update("INSERT INTO t VALUES (1)", params![])
        .unwrap();
    drop(guard);
    assert_eq!(pool.total_count(), 1);
}

#[tokio::test]
async fn try_acquire_fails_once_the_bound_is_reached() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir, 1);

    let held = pool.try_acquire().unwrap();
    let exhausted = pool.try_acquire();
    assert!(matches!(exhausted, Err(DispatchError::PoolExhausted(_))));
    drop(held);
    let _recovered = pool.try_acquire().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acquire_waits_for_a_release_on_a_bound_of_one() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir, 1);

    let held = pool.acquire().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let guard = pool.acquire().await.unwrap();
            drop(guard);
        })
    };

    // The waiter cannot finish while the only connection is held.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    drop(held);
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should acquire after the release")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn the_bound_is_never_exceeded_under_contention() {
    const BOUND: usize = 3;
    const TASKS: usize = 24;

    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir, BOUND);
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let pool = pool.clone();
        let live = Arc::clone(&live);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            let guard = pool.acquire().await.unwrap();
            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            live.fetch_sub(1, Ordering::SeqCst);
            drop(guard);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= BOUND);
    assert!(pool.total_count() <= BOUND);
    assert_eq!(pool.checked_out_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_releases_wake_every_waiter() {
    const BOUND: usize = 2;
    const TASKS: usize = 16;
    const ROUNDS: usize = 50;

    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir, BOUND);

    // Many tasks repeatedly acquiring while releases land back-to-back; a
    // dropped wakeup would leave a waiter parked with a connection idle, and
    // the timeout would trip.
    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let guard = pool.acquire().await.unwrap();
                tokio::task::yield_now().await;
                drop(guard);
            }
        }));
    }
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("an acquire never completed")
            .unwrap();
    }
    assert_eq!(pool.checked_out_count(), 0);
    assert!(pool.total_count() <= BOUND);
}

#[tokio::test]
async fn with_connection_and_with_transaction_release_their_guards() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir, 2);

    pool.with_connection(|conn| conn.execute_batch("CREATE TABLE t (v TEXT)"))
        .await
        .unwrap();
    assert_eq!(pool.checked_out_count(), 0);

    pool.with_transaction(TransactionKind::Exclusive, |conn, _rollback| {
        conn.execute_update("INSERT INTO t VALUES ('kept')", params![])?;
        Ok(())
    })
    .await
    .unwrap();

    pool.with_transaction(TransactionKind::Deferred, |conn, rollback| {
        conn.execute_update("INSERT INTO t VALUES ('dropped')", params![])?;
        *rollback = true;
        Ok(())
    })
    .await
    .unwrap();

    let count = pool
        .with_connection(|conn| {
            let mut cursor = conn.execute_query("SELECT COUNT(*) FROM t", params![])?;
            assert!(cursor.advance()?);
            cursor.i64_at(0)
        })
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(pool.checked_out_count(), 0);
}

#[tokio::test]
async fn a_mid_transaction_release_discards_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir, 2);

    let guard = pool.acquire().await.unwrap();
    guard.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
    guard.begin_transaction().unwrap();
    guard
        .execute_update("INSERT INTO t VALUES (1)", params![])
        .unwrap();
    drop(guard); // rolled back and not re-pooled

    assert_eq!(pool.checked_in_count(), 0);
    let count = pool
        .with_connection(|conn| {
            let mut cursor = conn.execute_query("SELECT COUNT(*) FROM t", params![])?;
            assert!(cursor.advance()?);
            cursor.i64_at(0)
        })
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn release_all_orphans_outstanding_guards() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir, 4);

    let held = pool.acquire().await.unwrap();
    held.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
    let parked = pool.acquire().await.unwrap();
    drop(parked);
    assert_eq!(pool.checked_in_count(), 1);

    pool.release_all();
    assert_eq!(pool.checked_in_count(), 0);

    // A guard from before release_all still works but is discarded on drop.
    held.execute_update("INSERT INTO t VALUES (1)", params![])
        .unwrap();
    drop(held);
    assert_eq!(pool.checked_in_count(), 0);
    assert_eq!(pool.checked_out_count(), 0);
}

struct VetoAll;

impl PoolDelegate for VetoAll {
    fn should_pool(&self, _conn: &Connection) -> bool {
        false
    }
}

#[tokio::test]
async fn a_vetoing_delegate_prevents_re_pooling() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ConnectionPool::builder(dir.path().join("pool.db"))
        .max_size(2)
        .delegate(VetoAll)
        .build();

    let guard = pool.acquire().await.unwrap();
    guard.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
    drop(guard);
    assert_eq!(pool.checked_in_count(), 0);
    assert_eq!(pool.total_count(), 0);
}
