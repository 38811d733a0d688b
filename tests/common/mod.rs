#![allow(dead_code)]

use async_trait::async_trait;
use guarded_pool::{ConnectTarget, Manager, PoolConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct TestConnection {
    pub id: u64,
    pub target: ConnectTarget,
    pub closed: bool,
    /// uncommitted work pending
    pub in_transaction: bool,
}

/// In-memory manager; counters are shared so tests keep a handle after
/// the pool takes ownership.
#[derive(Debug, Clone, Default)]
pub struct TestManager {
    pub connects: Arc<AtomicU64>,
    pub closes: Arc<AtomicU64>,
    pub probes: Arc<AtomicU64>,
    pub rollbacks: Arc<AtomicU64>,
    /// the next n probes fail
    pub failing_probes: Arc<AtomicUsize>,
    /// the next n rollbacks fail
    pub failing_rollbacks: Arc<AtomicUsize>,
    pub refuse_connect: Arc<AtomicBool>,
}

impl TestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn fail_probes(&self, n: usize) {
        self.failing_probes.store(n, Ordering::SeqCst);
    }

    pub fn fail_rollbacks(&self, n: usize) {
        self.failing_rollbacks.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Manager for TestManager {
    type Connection = TestConnection;
    type Error = String;

    async fn connect(&self, target: &ConnectTarget) -> Result<Self::Connection, Self::Error> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(format!("connection refused: {}", target.endpoint));
        }
        let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TestConnection {
            id,
            target: target.clone(),
            closed: false,
            in_transaction: false,
        })
    }

    fn is_closed(&self, conn: &Self::Connection) -> bool {
        conn.closed
    }

    async fn probe(&self, conn: &mut Self::Connection, query: &str) -> Result<(), Self::Error> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_probes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(format!("{} failed on connection {}", query, conn.id));
        }
        Ok(())
    }

    fn auto_commit(&self, conn: &Self::Connection) -> bool {
        !conn.in_transaction
    }

    async fn rollback(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_rollbacks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(format!("rollback failed on connection {}", conn.id));
        }
        conn.in_transaction = false;
        Ok(())
    }

    async fn close(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        conn.closed = true;
        Ok(())
    }
}

pub fn config() -> PoolConfig {
    PoolConfig::new("mem://test", "app", "secret")
}

/// Let spawned releases run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
