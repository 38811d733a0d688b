use crate::config::{self, PoolConfig};
use crate::connection::Handle;
use crate::error::{ConfigError, PoolError};
use crate::guard::PooledConnection;
use crate::state::{Counters, State};
use crate::Manager;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lists and counters, only touched while holding the pool lock
struct PoolState<C> {
    config: PoolConfig,
    expected_type_code: u64,
    /// front is handed out next
    idle: VecDeque<Arc<Handle<C>>>,
    /// in checkout order, oldest first
    active: Vec<Arc<Handle<C>>>,
    counters: Counters,
}

impl<C> PoolState<C> {
    fn snapshot(&self, waits: u64) -> State {
        State::new(
            self.config.max_active,
            self.config.max_idle,
            self.active.len(),
            self.idle.len(),
            waits,
            &self.counters,
        )
    }
}

enum Reclaim<C> {
    NotOverdue,
    /// overdue, but the old holder still has the raw connection locked
    Busy,
    Claimed(Arc<Handle<C>>),
}

/// Counts a caller in `waits` for as long as it is alive.
struct Waiting<'a>(&'a AtomicU64);

impl<'a> Waiting<'a> {
    fn enter(waits: &'a AtomicU64) -> Self {
        waits.fetch_add(1, Ordering::SeqCst);
        Self(waits)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pool have manager, get/release connections through it
///
/// A checkout takes an idle connection, opens a new one while below
/// `max_active`, reclaims the oldest checkout once it is overdue, or waits.
/// Every candidate is validated before it is handed out; bad ones are
/// discarded and the checkout retries up to the bad-connection tolerance.
pub struct Pool<M: Manager> {
    pub manager: Arc<M>,
    inner: Arc<Mutex<PoolState<M::Connection>>>,
    available: Arc<Notify>,
    waits: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
}

impl<M: Manager> Debug for Pool<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Ok(state) => Debug::fmt(&state.snapshot(self.waits.load(Ordering::Relaxed)), f),
            Err(_) => f.write_str("Pool { <locked> }"),
        }
    }
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            inner: self.inner.clone(),
            available: self.available.clone(),
            waits: self.waits.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<M: Manager> Pool<M> {
    pub fn new(m: M, config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = PoolState {
            expected_type_code: config.expected_type_code(),
            config,
            idle: VecDeque::new(),
            active: Vec::new(),
            counters: Counters::default(),
        };
        Ok(Self {
            manager: Arc::new(m),
            inner: Arc::new(Mutex::new(state)),
            available: Arc::new(Notify::new()),
            waits: Arc::new(AtomicU64::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Check out a connection with the configured credentials.
    pub async fn get(&self) -> Result<PooledConnection<M>, PoolError> {
        let (principal, credential) = {
            let state = self.inner.lock().await;
            (state.config.principal.clone(), state.config.credential.clone())
        };
        self.get_as(&principal, &credential).await
    }

    pub async fn get_as(
        &self,
        principal: &str,
        credential: &str,
    ) -> Result<PooledConnection<M>, PoolError> {
        self.get_until(principal, credential, &CancellationToken::new())
            .await
    }

    /// Check out a connection, giving up with [`PoolError::Unavailable`]
    /// if `cancel` fires while waiting for one.
    pub async fn get_until(
        &self,
        principal: &str,
        credential: &str,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<M>, PoolError> {
        let _waiting = Waiting::enter(&self.waits);
        let started = Instant::now();
        let mut counted_wait = false;
        let mut local_bad = 0usize;
        let mut guard = self.inner.lock().await;
        loop {
            let state = &mut *guard;
            let candidate = if let Some(handle) = state.idle.pop_front() {
                debug!(conn = handle.id(), "checked out connection from pool");
                Some(handle)
            } else if state.active.len() < state.config.max_active {
                let target = state.config.target_for(principal, credential);
                let conn = self
                    .manager
                    .connect(&target)
                    .await
                    .map_err(|e| PoolError::Connect(e.to_string()))?;
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let handle = Arc::new(Handle::new(id, conn));
                debug!(conn = handle.id(), "created connection");
                Some(handle)
            } else {
                match self.claim_overdue(state).await {
                    Reclaim::Claimed(handle) => Some(handle),
                    // its slot is free now, the next pass opens a new connection
                    Reclaim::Busy => continue,
                    Reclaim::NotOverdue => None,
                }
            };

            let Some(candidate) = candidate else {
                if !counted_wait {
                    state.counters.had_to_wait_count += 1;
                    counted_wait = true;
                }
                let wait = state.config.time_to_wait;
                debug!(?wait, "waiting for connection");
                let notified = self.available.notified();
                tokio::pin!(notified);
                // registered before unlocking, so a release in between still wakes us
                notified.as_mut().enable();
                drop(guard);
                let wait_started = Instant::now();
                tokio::select! {
                    _ = tokio::time::timeout(wait, notified) => {}
                    _ = cancel.cancelled() => {
                        debug!("interrupted while waiting for connection");
                        return Err(PoolError::Unavailable(
                            "interrupted while waiting for a connection".to_string(),
                        ));
                    }
                }
                guard = self.inner.lock().await;
                guard.counters.accumulated_wait_time += wait_started.elapsed();
                continue;
            };

            let usable = match self.validate(&state.config, &candidate).await {
                Some(mut conn) => self.rollback_if_needed(candidate.id(), &mut conn).await,
                None => false,
            };
            if usable {
                candidate.checkout(config::type_code(
                    &state.config.endpoint,
                    principal,
                    credential,
                ));
                state.active.push(candidate.clone());
                state.counters.request_count += 1;
                state.counters.accumulated_request_time += started.elapsed();
                return Ok(PooledConnection::new(candidate, self.clone()));
            }

            debug!(
                conn = candidate.id(),
                "a bad connection was returned from the pool, getting another connection"
            );
            candidate.invalidate();
            state.counters.bad_connection_count += 1;
            local_bad += 1;
            if local_bad > state.config.max_idle + state.config.max_local_bad_connection_tolerance {
                debug!(attempts = local_bad, "could not get a good connection to the database");
                return Err(PoolError::Exhausted {
                    attempts: local_bad,
                });
            }
        }
    }

    /// Return a checked-out connection. Never fails; a connection that
    /// does not validate is discarded.
    pub async fn release(&self, conn: PooledConnection<M>) {
        conn.release().await
    }

    pub(crate) async fn recycle(&self, handle: Arc<Handle<M::Connection>>) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if let Some(pos) = state.active.iter().position(|h| Arc::ptr_eq(h, &handle)) {
            state.active.remove(pos);
        }
        let Some(mut conn) = self.validate(&state.config, &handle).await else {
            debug!(
                conn = handle.id(),
                "a bad connection attempted to return to the pool, discarding connection"
            );
            state.counters.bad_connection_count += 1;
            return;
        };
        state.counters.accumulated_checkout_time += handle.checkout_time();
        let clean = self.rollback_if_needed(handle.id(), &mut conn).await;
        if clean
            && state.idle.len() < state.config.max_idle
            && handle.type_code() == state.expected_type_code
        {
            drop(conn);
            state.idle.push_back(Arc::new(handle.rewrap()));
            handle.invalidate();
            debug!(conn = handle.id(), "returned connection to pool");
            self.available.notify_one();
        } else {
            if let Err(e) = self.manager.close(&mut conn).await {
                debug!(conn = handle.id(), error = %e, "close failed");
            }
            handle.invalidate();
            debug!(conn = handle.id(), "closed connection");
        }
    }

    /// Drop a checkout without awaiting anything. Frees its slot unless the
    /// pool lock is contended, in which case overdue reclaim recovers it.
    pub(crate) fn detach(&self, handle: &Arc<Handle<M::Connection>>) {
        handle.invalidate();
        let Ok(mut state) = self.inner.try_lock() else {
            debug!(conn = handle.id(), "pool busy, leaving checkout for reclaim");
            return;
        };
        if let Some(pos) = state.active.iter().position(|h| Arc::ptr_eq(h, handle)) {
            state.active.remove(pos);
            state.counters.accumulated_checkout_time += handle.checkout_time();
            drop(state);
            self.available.notify_one();
        }
    }

    /// Remove the oldest checkout if it has been out longer than
    /// `max_checkout_time`, and wrap its raw connection in a new handle.
    ///
    /// A raw connection its old holder is still using is not handed out;
    /// it leaves the pool and is dropped along with that holder.
    async fn claim_overdue(&self, state: &mut PoolState<M::Connection>) -> Reclaim<M::Connection> {
        let Some(oldest) = state.active.first() else {
            return Reclaim::NotOverdue;
        };
        let overdue = oldest.checkout_time();
        if overdue <= state.config.max_checkout_time {
            return Reclaim::NotOverdue;
        }
        let oldest = state.active.remove(0);
        state.counters.claimed_overdue_count += 1;
        state.counters.accumulated_overdue_checkout_time += overdue;
        state.counters.accumulated_checkout_time += overdue;
        oldest.invalidate();
        let Ok(mut conn) = oldest.raw.try_lock() else {
            debug!(conn = oldest.id(), ?overdue, "overdue connection is still in use, dropping it");
            return Reclaim::Busy;
        };
        // a failed rollback leaves a bad connection; validation will catch it
        self.rollback_if_needed(oldest.id(), &mut conn).await;
        drop(conn);
        let handle = Arc::new(oldest.rewrap());
        debug!(conn = handle.id(), ?overdue, "claimed overdue connection");
        Reclaim::Claimed(handle)
    }

    /// Validity flag, then a try-lock of the raw connection, then [`Self::ping`].
    async fn validate<'h>(
        &self,
        config: &PoolConfig,
        handle: &'h Handle<M::Connection>,
    ) -> Option<MutexGuard<'h, M::Connection>> {
        if !handle.is_valid() {
            return None;
        }
        let Ok(mut conn) = handle.raw.try_lock() else {
            debug!(conn = handle.id(), "connection is still in use by a previous holder");
            return None;
        };
        if self.ping(config, handle, &mut conn).await {
            Some(conn)
        } else {
            None
        }
    }

    async fn ping(
        &self,
        config: &PoolConfig,
        handle: &Handle<M::Connection>,
        conn: &mut M::Connection,
    ) -> bool {
        if self.manager.is_closed(conn) {
            debug!(conn = handle.id(), "connection is closed");
            return false;
        }
        if !config.ping_enabled || handle.idle_time() <= config.ping_connections_not_used_for {
            return true;
        }
        debug!(conn = handle.id(), "testing connection");
        match self.manager.probe(conn, &config.ping_query).await {
            Ok(()) => {
                self.rollback_if_needed(handle.id(), conn).await;
                debug!(conn = handle.id(), "connection is good");
                true
            }
            Err(e) => {
                warn!(query = %config.ping_query, error = %e, "execution of ping query failed");
                if let Err(e) = self.manager.close(conn).await {
                    debug!(conn = handle.id(), error = %e, "close after failed ping failed");
                }
                debug!(conn = handle.id(), "connection is bad");
                false
            }
        }
    }

    async fn rollback_if_needed(&self, id: u64, conn: &mut M::Connection) -> bool {
        if self.manager.auto_commit(conn) {
            return true;
        }
        match self.manager.rollback(conn).await {
            Ok(()) => true,
            Err(e) => {
                debug!(conn = id, error = %e, "bad connection, could not roll back");
                false
            }
        }
    }

    /// Close every active and idle connection. Checked-out handles become
    /// invalid; failures while closing are ignored.
    pub async fn force_close_all(&self) {
        let mut state = self.inner.lock().await;
        self.close_all(&mut state).await;
    }

    async fn close_all(&self, state: &mut PoolState<M::Connection>) {
        state.expected_type_code = state.config.expected_type_code();
        let mut handles: Vec<_> = state.active.drain(..).collect();
        handles.extend(state.idle.drain(..));
        for handle in handles {
            handle.invalidate();
            let Ok(mut conn) = handle.raw.try_lock() else {
                debug!(conn = handle.id(), "connection in use, it closes when its holder drops it");
                continue;
            };
            if !self.manager.auto_commit(&conn) {
                _ = self.manager.rollback(&mut conn).await;
            }
            _ = self.manager.close(&mut conn).await;
        }
        debug!("forcefully closed/removed all connections");
    }

    /// Apply `f` to a copy of the config, validate it, swap it in and
    /// force-close everything opened under the old settings.
    pub async fn reconfigure<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut PoolConfig) + Send,
    {
        let mut state = self.inner.lock().await;
        let mut config = state.config.clone();
        f(&mut config);
        config.validate()?;
        state.config = config;
        self.close_all(&mut state).await;
        drop(state);
        self.available.notify_waiters();
        Ok(())
    }

    pub async fn set_max_active(&self, n: usize) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.max_active = n).await
    }

    pub async fn set_max_idle(&self, n: usize) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.max_idle = n).await
    }

    pub async fn set_credentials(
        &self,
        principal: impl Into<String>,
        credential: impl Into<String>,
    ) -> Result<(), ConfigError> {
        let (principal, credential) = (principal.into(), credential.into());
        self.reconfigure(move |c| {
            c.principal = principal;
            c.credential = credential;
        })
        .await
    }

    pub async fn config(&self) -> PoolConfig {
        self.inner.lock().await.config.clone()
    }

    /// Type code a connection must carry to go back to idle.
    pub async fn expected_type_code(&self) -> u64 {
        self.inner.lock().await.expected_type_code
    }

    pub async fn state(&self) -> State {
        let state = self.inner.lock().await;
        state.snapshot(self.waits.load(Ordering::SeqCst))
    }
}
