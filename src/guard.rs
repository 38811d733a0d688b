use crate::connection::Handle;
use crate::error::PoolError;
use crate::{Manager, Pool};
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::MutexGuard;

/// PooledConnection is a checked-out connection.
///
/// Hand it back with [`release`](Self::release); dropping it releases in a
/// spawned task instead. Once the pool reclaims or force-closes it, every
/// [`lock`](Self::lock) fails with [`PoolError::Invalidated`].
pub struct PooledConnection<M: Manager> {
    handle: Option<Arc<Handle<M::Connection>>>,
    pool: Pool<M>,
}

impl<M: Manager> PooledConnection<M> {
    pub(crate) fn new(handle: Arc<Handle<M::Connection>>, pool: Pool<M>) -> Self {
        Self {
            handle: Some(handle),
            pool,
        }
    }

    fn handle(&self) -> Result<&Arc<Handle<M::Connection>>, PoolError> {
        self.handle.as_ref().ok_or(PoolError::Invalidated)
    }

    /// Borrow the raw connection for one operation.
    pub async fn lock(&self) -> Result<ConnectionRef<'_, M::Connection>, PoolError> {
        let handle = self.handle()?;
        if !handle.is_valid() {
            return Err(PoolError::Invalidated);
        }
        let conn = handle.raw.lock().await;
        // may have been reclaimed while we waited
        if !handle.is_valid() {
            return Err(PoolError::Invalidated);
        }
        handle.touch();
        Ok(ConnectionRef { conn })
    }

    /// Id of the raw connection, stable across returns to the pool.
    pub fn id(&self) -> u64 {
        self.handle.as_ref().map(|h| h.id()).unwrap_or_default()
    }

    pub fn is_valid(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_valid())
    }

    pub fn type_code(&self) -> u64 {
        self.handle.as_ref().map(|h| h.type_code()).unwrap_or_default()
    }

    pub fn checkout_time(&self) -> Duration {
        self.handle
            .as_ref()
            .map(|h| h.checkout_time())
            .unwrap_or_default()
    }

    pub fn created_at(&self) -> Option<Instant> {
        self.handle.as_ref().map(|h| h.created_at())
    }

    /// Return the connection to its pool.
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.recycle(handle).await;
        }
    }
}

impl<M: Manager> Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("valid", &self.is_valid())
            .field("pool", &self.pool)
            .finish()
    }
}

impl<M: Manager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let pool = self.pool.clone();
                rt.spawn(async move { pool.recycle(handle).await });
            }
            Err(_) => {
                // no runtime to return it on; the raw connection is dropped unclosed
                tracing::debug!(conn = handle.id(), "dropped connection outside a runtime");
                self.pool.detach(&handle);
            }
        }
    }
}

/// Exclusive access to the raw connection behind a [`PooledConnection`].
pub struct ConnectionRef<'a, C> {
    conn: MutexGuard<'a, C>,
}

impl<C> Deref for ConnectionRef<'_, C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<C> DerefMut for ConnectionRef<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}
