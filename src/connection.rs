use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, Copy)]
struct Stamps {
    created_at: Instant,
    last_used_at: Instant,
    checkout_at: Instant,
    type_code: u64,
}

/// One wrapper around a raw connection.
///
/// The raw connection is shared by every wrapper created for it, but only
/// the newest wrapper is valid. Returning or reclaiming a connection
/// builds a fresh wrapper and invalidates the old one, so stale holders
/// fail fast instead of reaching the raw connection.
pub(crate) struct Handle<C> {
    id: u64,
    pub(crate) raw: Arc<AsyncMutex<C>>,
    valid: AtomicBool,
    stamps: Mutex<Stamps>,
}

impl<C> Handle<C> {
    pub fn new(id: u64, conn: C) -> Self {
        let now = Instant::now();
        Self {
            id,
            raw: Arc::new(AsyncMutex::new(conn)),
            valid: AtomicBool::new(true),
            stamps: Mutex::new(Stamps {
                created_at: now,
                last_used_at: now,
                checkout_at: now,
                type_code: 0,
            }),
        }
    }

    /// New valid wrapper over the same raw connection, keeping creation
    /// and last-use times. The caller invalidates `self`.
    pub fn rewrap(&self) -> Self {
        let old = *self.stamps.lock();
        Self {
            id: self.id,
            raw: self.raw.clone(),
            valid: AtomicBool::new(true),
            stamps: Mutex::new(old),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn type_code(&self) -> u64 {
        self.stamps.lock().type_code
    }

    pub fn created_at(&self) -> Instant {
        self.stamps.lock().created_at
    }

    /// Stamp a successful checkout.
    pub fn checkout(&self, type_code: u64) {
        let now = Instant::now();
        let mut stamps = self.stamps.lock();
        stamps.type_code = type_code;
        stamps.checkout_at = now;
        stamps.last_used_at = now;
    }

    pub fn touch(&self) {
        self.stamps.lock().last_used_at = Instant::now();
    }

    #[inline]
    pub fn checkout_time(&self) -> Duration {
        self.stamps.lock().checkout_at.elapsed()
    }

    #[inline]
    pub fn idle_time(&self) -> Duration {
        self.stamps.lock().last_used_at.elapsed()
    }
}
