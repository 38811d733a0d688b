mod common;

use common::{config, settle, TestManager};
use guarded_pool::config::type_code;
use guarded_pool::{Pool, PoolError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_debug() {
    let p = Pool::new(TestManager::new(), config()).unwrap();
    println!("{:?}", p);
    println!("{}", p.state().await);
}

#[tokio::test]
async fn test_pool_get() {
    let p = Pool::new(TestManager::new(), config().with_max_active(10)).unwrap();
    let mut arr = vec![];
    for _ in 0..10 {
        arr.push(p.get().await.unwrap());
    }
    let ids: HashSet<u64> = arr.iter().map(|c| c.id()).collect();
    assert_eq!(ids.len(), 10);
    let state = p.state().await;
    assert_eq!(state.active, 10);
    assert_eq!(state.idle, 0);
    assert_eq!(state.request_count, 10);
}

#[tokio::test]
async fn test_release_reuses_connection() {
    let m = TestManager::new();
    let p = Pool::new(m.clone(), config()).unwrap();

    let conn = p.get().await.unwrap();
    let id = conn.id();
    p.release(conn).await;
    assert_eq!(p.state().await.idle, 1);

    let conn = p.get().await.unwrap();
    assert_eq!(conn.id(), id);
    assert!(conn.is_valid());
    assert_eq!(conn.type_code(), p.expected_type_code().await);
    assert_eq!(conn.lock().await.unwrap().target.principal, "app");
    assert_eq!(m.connects(), 1);
}

#[tokio::test]
async fn test_max_idle() {
    let m = TestManager::new();
    let p = Pool::new(m.clone(), config().with_max_active(5).with_max_idle(2)).unwrap();
    let mut arr = vec![];
    for _ in 0..5 {
        arr.push(p.get().await.unwrap());
    }
    for conn in arr {
        p.release(conn).await;
    }
    let state = p.state().await;
    assert_eq!(state.idle, 2);
    assert_eq!(state.active, 0);
    assert_eq!(m.closes(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_active_never_exceeds_max() {
    let p = Pool::new(
        TestManager::new(),
        config()
            .with_max_active(3)
            .with_max_idle(3)
            .with_time_to_wait(Duration::from_millis(50)),
    )
    .unwrap();
    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];
    for _ in 0..20 {
        let pool = p.clone();
        let in_use = in_use.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let conn = pool.get().await.unwrap();
            let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_use.fetch_sub(1, Ordering::SeqCst);
            pool.release(conn).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    let state = p.state().await;
    assert_eq!(state.active, 0);
    assert!(state.idle <= 3);
    assert_eq!(state.request_count, 20);
    assert_eq!(state.waits, 0);
}

#[tokio::test]
async fn test_had_to_wait() {
    let p = Pool::new(TestManager::new(), config().with_max_active(1)).unwrap();
    let first = p.get().await.unwrap();
    let first_id = first.id();

    let pool = p.clone();
    let waiter = tokio::spawn(async move { pool.get().await.map(|c| c.id()) });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(p.state().await.waits, 1);

    p.release(first).await;
    assert_eq!(waiter.await.unwrap(), Ok(first_id));

    let state = p.state().await;
    assert_eq!(state.had_to_wait_count, 1);
    assert!(state.accumulated_wait_time >= Duration::from_millis(40));
    assert_eq!(state.claimed_overdue_count, 0);
}

#[tokio::test]
async fn test_cancel_while_waiting() {
    let p = Pool::new(TestManager::new(), config().with_max_active(1)).unwrap();
    let _held = p.get().await.unwrap();

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });
    let result = p.get_until("app", "secret", &token).await;
    assert!(matches!(result, Err(PoolError::Unavailable(_))));
    assert_eq!(p.state().await.waits, 0);
}

#[tokio::test]
async fn test_reconfigure_invalidates_handles() {
    let m = TestManager::new();
    let p = Pool::new(m.clone(), config()).unwrap();
    let held = p.get().await.unwrap();
    let idle = p.get().await.unwrap();
    p.release(idle).await;
    let old_code = held.type_code();

    p.set_credentials("other", "pw").await.unwrap();
    assert!(!held.is_valid());
    assert_eq!(held.lock().await.err(), Some(PoolError::Invalidated));
    assert_eq!(m.closes(), 2);
    let state = p.state().await;
    assert_eq!((state.active, state.idle), (0, 0));

    // returning a force-closed handle counts as a bad connection
    p.release(held).await;
    assert_eq!(p.state().await.bad_connection_count, 1);

    let conn = p.get().await.unwrap();
    assert_ne!(conn.type_code(), old_code);
    assert_eq!(conn.type_code(), type_code("mem://test", "other", "pw"));
    assert_eq!(conn.type_code(), p.expected_type_code().await);
    assert_eq!(conn.lock().await.unwrap().target.principal, "other");
}

#[tokio::test]
async fn test_reconfigure_rejects_invalid() {
    let p = Pool::new(TestManager::new(), config()).unwrap();
    assert!(p.set_max_active(0).await.is_err());
    assert_eq!(p.config().await.max_active, 10);
    p.set_max_idle(1).await.unwrap();
    assert_eq!(p.state().await.max_idle, 1);
}

#[tokio::test]
async fn test_connect_error() {
    let m = TestManager::new();
    m.refuse_connect.store(true, Ordering::SeqCst);
    let p = Pool::new(m, config()).unwrap();
    let err = p.get().await.unwrap_err();
    assert_eq!(
        err,
        PoolError::Connect("connection refused: mem://test".to_string())
    );
    assert_eq!(p.state().await.active, 0);
}

#[tokio::test]
async fn test_other_credentials_are_not_pooled() {
    let m = TestManager::new();
    let p = Pool::new(m.clone(), config()).unwrap();
    let conn = p.get_as("guest", "guest").await.unwrap();
    assert_eq!(conn.lock().await.unwrap().target.principal, "guest");
    assert_ne!(conn.type_code(), p.expected_type_code().await);

    p.release(conn).await;
    let state = p.state().await;
    assert_eq!(state.idle, 0);
    assert_eq!(m.closes(), 1);
}

#[tokio::test]
async fn test_drop_returns_connection() {
    let p = Pool::new(TestManager::new(), config()).unwrap();
    let conn = p.get().await.unwrap();
    let id = conn.id();
    drop(conn);
    settle().await;

    let state = p.state().await;
    assert_eq!(state.active, 0);
    assert_eq!(state.idle, 1);
    assert_eq!(p.get().await.unwrap().id(), id);
}

#[tokio::test]
async fn test_release_rolls_back_open_transaction() {
    let m = TestManager::new();
    let p = Pool::new(m.clone(), config()).unwrap();
    let conn = p.get().await.unwrap();
    conn.lock().await.unwrap().in_transaction = true;
    p.release(conn).await;
    assert_eq!(m.rollbacks(), 1);

    let conn = p.get().await.unwrap();
    assert!(!conn.lock().await.unwrap().in_transaction);
}

#[tokio::test]
async fn test_statistics() {
    let p = Pool::new(TestManager::new(), config()).unwrap();
    for _ in 0..4 {
        let conn = p.get().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        p.release(conn).await;
    }
    let state = p.state().await;
    assert_eq!(state.request_count, 4);
    assert!(state.accumulated_checkout_time >= Duration::from_millis(20));
    assert!(state.average_checkout_time() >= Duration::from_millis(5));
    assert_eq!(state.average_wait_time(), Duration::ZERO);
    assert_eq!(state.bad_connection_count, 0);
}

#[test]
fn test_drop_outside_runtime_frees_slot() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let m = TestManager::new();
    let p = Pool::new(m.clone(), config().with_max_active(1)).unwrap();
    let conn = rt.block_on(p.get()).unwrap();
    assert!(conn.is_valid());
    drop(conn);

    let state = rt.block_on(p.state());
    assert_eq!(state.active, 0);
    assert_eq!(state.idle, 0);
    // the slot is free again, so this opens a new connection without waiting
    let conn = rt.block_on(p.get()).unwrap();
    assert_eq!(m.connects(), 2);
    assert_eq!(m.closes(), 0);
    drop(conn);
}
