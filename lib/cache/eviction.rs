//! Strategies invoked when a [`KeyedCache`](super::KeyedCache) removes an entry.
//!
//! A hook is stored on the cache at construction time and receives the key together with the
//! stored result (values and cached errors alike). Hooks are expected to release whatever
//! resource is embedded in the value, such as an open handle or a shared stream.

use std::{fmt::Display, future::Future, sync::Arc};

use tracing::warn;

/// Called once for every entry a cache removes.
///
/// Hooks run inline with the removing operation: a flush awaits each hook in turn before it moves
/// on to the next entry.
pub trait EvictionHook<V, E>: Send + Sync {
    /// Release whatever `value` holds. `key` is the key the value was stored under.
    fn evict(&self, key: &str, value: Result<V, E>) -> impl Future<Output = ()> + Send;
}

/// Hook that does nothing. The default for caches built without an eviction hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEviction;

impl<V: Send, E: Send> EvictionHook<V, E> for NoEviction {
    fn evict(&self, _key: &str, value: Result<V, E>) -> impl Future<Output = ()> + Send {
        drop(value);
        std::future::ready(())
    }
}

impl<V, E, F> EvictionHook<V, E> for F
where
    F: Fn(&str, Result<V, E>) + Send + Sync,
{
    fn evict(&self, key: &str, value: Result<V, E>) -> impl Future<Output = ()> + Send {
        self(key, value);
        std::future::ready(())
    }
}

/// A resource that must be explicitly released when it leaves a cache.
pub trait Release: Send + Sync {
    /// Error reported by a failed release. Only ever logged.
    type Error: Display;

    /// Release the resource.
    fn release(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

impl<T: Release> Release for Arc<T> {
    type Error = T::Error;

    fn release(&self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        T::release(self)
    }
}

/// Hook that calls [`Release::release`] on evicted values.
///
/// Cached errors carry no resource and are dropped. Release failures are logged and swallowed so
/// that a flush always runs to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseOnEvict;

impl<V: Release, E: Send> EvictionHook<V, E> for CloseOnEvict {
    async fn evict(&self, key: &str, value: Result<V, E>) {
        let Ok(resource) = value else {
            return;
        };

        if let Err(e) = resource.release().await {
            warn!(key, error = %e, "Failed to release evicted resource.");
        }
    }
}
