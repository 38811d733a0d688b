//! Per-key blocking decorator over a plain cache.
//!
//! [`BlockingCache`] makes sure that only one caller loads a missing key at
//! a time. A miss hands the caller the key's lock as a [`KeyLock`]; other
//! callers asking for the same key wait until it is released by
//! [`BlockingCache::put`] or [`BlockingCache::release`], then look again.
//!
//! ```no_run
//! use guarded_pool::{BlockingCache, CacheError, Lookup, PerpetualCache};
//!
//! # async fn run() -> Result<(), CacheError> {
//! let cache = BlockingCache::new(PerpetualCache::<String, u64>::new("users"));
//! let key = "alice".to_string();
//! match cache.get(&key).await? {
//!     Lookup::Hit(v) => println!("cached {v}"),
//!     Lookup::Miss(lock) => cache.put(lock, 42),
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::CacheError;
use dark_std::sync::AtomicDuration;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as KeyMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A plain key/value cache with no locking of its own.
pub trait Cache: Send + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;
    type Value: Clone + Send + 'static;

    fn id(&self) -> &str;
    fn get(&mut self, key: &Self::Key) -> Option<Self::Value>;
    fn put(&mut self, key: Self::Key, value: Self::Value);
    fn remove(&mut self, key: &Self::Key) -> Option<Self::Value>;
    fn clear(&mut self);
    fn size(&self) -> usize;
}

/// Unbounded `HashMap` cache
#[derive(Debug, Clone)]
pub struct PerpetualCache<K, V> {
    id: String,
    entries: HashMap<K, V>,
}

impl<K, V> PerpetualCache<K, V> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: HashMap::new(),
        }
    }
}

impl<K, V> Cache for PerpetualCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    type Key = K;
    type Value = V;

    fn id(&self) -> &str {
        &self.id
    }

    fn get(&mut self, key: &K) -> Option<V> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    fn clear(&mut self) {
        self.entries.clear()
    }

    fn size(&self) -> usize {
        self.entries.len()
    }
}

/// Result of [`BlockingCache::get`]
pub enum Lookup<K, V> {
    /// The value was cached; the key lock is already released.
    Hit(V),
    /// Nothing cached. The caller holds the key lock and must `put` or
    /// `release` it.
    Miss(KeyLock<K>),
}

impl<K: Debug, V: Debug> Debug for Lookup<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Lookup::Hit(v) => f.debug_tuple("Hit").field(v).finish(),
            Lookup::Miss(lock) => f.debug_tuple("Miss").field(lock).finish(),
        }
    }
}

impl<K, V> Lookup<K, V> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn hit(self) -> Option<V> {
        match self {
            Lookup::Hit(v) => Some(v),
            Lookup::Miss(_) => None,
        }
    }

    pub fn miss(self) -> Option<KeyLock<K>> {
        match self {
            Lookup::Hit(_) => None,
            Lookup::Miss(lock) => Some(lock),
        }
    }
}

/// The held lock of one cache key. Dropping it releases the lock.
pub struct KeyLock<K> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Debug> KeyLock<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    /// Release the key lock. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if self.guard.take().is_some() {
            trace!(key = ?self.key, "released key lock");
        }
    }
}

impl<K: Debug> Debug for KeyLock<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLock")
            .field("key", &self.key)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Cache decorator that serializes loads per key.
///
/// Different keys never block each other. Lock entries are created on
/// first use and kept for the life of the decorator.
pub struct BlockingCache<C: Cache> {
    delegate: Mutex<C>,
    locks: Mutex<HashMap<C::Key, Arc<KeyMutex<()>>>>,
    /// None waits forever
    timeout: AtomicDuration,
}

impl<C: Cache> Debug for BlockingCache<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingCache")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("locks", &self.lock_count())
            .field("timeout", &self.timeout())
            .finish()
    }
}

impl<C: Cache> BlockingCache<C> {
    pub fn new(delegate: C) -> Self {
        Self {
            delegate: Mutex::new(delegate),
            locks: Mutex::new(HashMap::new()),
            timeout: AtomicDuration::new(None),
        }
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_timeout(Some(timeout));
        self
    }

    /// Bound for waiting on a key lock; `None` or zero waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.timeout.store(timeout.filter(|d| !d.is_zero()));
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.get()
    }

    pub fn id(&self) -> String {
        self.delegate.lock().id().to_string()
    }

    pub fn size(&self) -> usize {
        self.delegate.lock().size()
    }

    /// Number of keys that ever had a lock.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    pub async fn get(&self, key: &C::Key) -> Result<Lookup<C::Key, C::Value>, CacheError> {
        self.get_until(key, &CancellationToken::new()).await
    }

    /// Like [`get`](Self::get), failing with [`CacheError::Interrupted`] if
    /// `cancel` fires while waiting for the key lock.
    pub async fn get_until(
        &self,
        key: &C::Key,
        cancel: &CancellationToken,
    ) -> Result<Lookup<C::Key, C::Value>, CacheError> {
        let lock = self.acquire(key, cancel).await?;
        let value = self.delegate.lock().get(key);
        Ok(match value {
            // dropping the lock releases it
            Some(v) => Lookup::Hit(v),
            None => Lookup::Miss(lock),
        })
    }

    /// Store `value` under the locked key, then release the lock.
    pub fn put(&self, mut lock: KeyLock<C::Key>, value: C::Value) {
        self.delegate.lock().put(lock.key.clone(), value);
        lock.release();
    }

    /// Store `value` without going through the key lock. A caller loading
    /// the same key may still overwrite it with its own `put`.
    pub fn insert(&self, key: C::Key, value: C::Value) {
        self.delegate.lock().put(key, value);
    }

    /// Give up a missed key without storing anything.
    pub fn release(&self, mut lock: KeyLock<C::Key>) {
        lock.release();
    }

    /// Clears the delegate. Held key locks are left alone.
    pub fn clear(&self) {
        self.delegate.lock().clear();
    }

    /// Cached value, or the result of `load` stored for the next caller.
    /// A failed load releases the key without storing.
    pub async fn get_or_load<F, Fut, E>(&self, key: &C::Key, load: F) -> Result<C::Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C::Value, E>>,
        E: From<CacheError>,
    {
        match self.get(key).await? {
            Lookup::Hit(v) => Ok(v),
            Lookup::Miss(lock) => match load().await {
                Ok(v) => {
                    self.put(lock, v.clone());
                    Ok(v)
                }
                Err(e) => {
                    self.release(lock);
                    Err(e)
                }
            },
        }
    }

    fn lock_for(&self, key: &C::Key) -> Arc<KeyMutex<()>> {
        self.locks.lock().entry(key.clone()).or_default().clone()
    }

    async fn acquire(
        &self,
        key: &C::Key,
        cancel: &CancellationToken,
    ) -> Result<KeyLock<C::Key>, CacheError> {
        let acquire = self.lock_for(key).lock_owned();
        let interrupted = || CacheError::Interrupted {
            key: format!("{key:?}"),
        };
        let guard = match self.timeout.get() {
            Some(timeout) => tokio::select! {
                r = tokio::time::timeout(timeout, acquire) => {
                    r.map_err(|_| CacheError::LockTimeout {
                        key: format!("{key:?}"),
                        cache: self.id(),
                        timeout,
                    })?
                }
                _ = cancel.cancelled() => return Err(interrupted()),
            },
            None => tokio::select! {
                g = acquire => g,
                _ = cancel.cancelled() => return Err(interrupted()),
            },
        };
        trace!(?key, "acquired key lock");
        Ok(KeyLock {
            key: key.clone(),
            guard: Some(guard),
        })
    }
}
