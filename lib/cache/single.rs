//! A single cached value with a TTL.
//!
//! Unlike [`KeyedCache`](super::KeyedCache), failures are never cached here: a failed
//! [`update`](SingleValueCache::update) leaves the previous slot untouched, so the next call retries
//! straight away.

use std::{future::Future, time::Duration};

use parking_lot::RwLock;
use tokio::{sync::Mutex, time::Instant};
use tracing::trace;

struct Slot<T> {
    value: T,
    updated_at: Instant,
}

/// One value, one TTL, no key.
pub struct SingleValueCache<T> {
    ttl: Duration,
    slot: RwLock<Option<Slot<T>>>,
    /// Serializes recomputation so concurrent `update` calls collapse into one.
    update_lock: Mutex<()>,
}

impl<T: Clone> SingleValueCache<T> {
    /// Create an empty cache whose values stay valid for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
            update_lock: Mutex::new(()),
        }
    }

    /// The TTL this cache was built with.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn fresh(&self) -> Option<T> {
        self.slot
            .read()
            .as_ref()
            .filter(|slot| slot.updated_at.elapsed() < self.ttl)
            .map(|slot| slot.value.clone())
    }

    /// Return the value if it is younger than the TTL. A stale value is cleared.
    pub fn get(&self) -> Option<T> {
        if let Some(value) = self.fresh() {
            return Some(value);
        }

        let mut slot = self.slot.write();
        if slot
            .as_ref()
            .is_some_and(|s| s.updated_at.elapsed() >= self.ttl)
        {
            trace!("Clearing stale cached value.");
            *slot = None;
        }
        // A concurrent `set` may have landed between the two locks.
        slot.as_ref().map(|s| s.value.clone())
    }

    /// Store `value` and restart its TTL.
    pub fn set(&self, value: T) {
        *self.slot.write() = Some(Slot {
            value,
            updated_at: Instant::now(),
        });
    }

    /// Drop the cached value.
    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    /// Return the cached value if still valid, otherwise compute, store and return a new one.
    ///
    /// Only one `compute` runs at a time; callers that queued behind it reuse its value. On
    /// failure nothing is stored and the error is returned.
    pub async fn update<F, Fut, E>(&self, compute: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.fresh() {
            return Ok(value);
        }

        let _guard = self.update_lock.lock().await;
        if let Some(value) = self.fresh() {
            return Ok(value);
        }

        let value = compute().await?;
        self.set(value.clone());
        Ok(value)
    }
}
