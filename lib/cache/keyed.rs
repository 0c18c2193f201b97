//! Key-addressed cache with single-flight regeneration and per-entry expiry.
//!
//! Every entry stores the full `Result` produced by its generator, so a failed remote call is
//! served back to callers until its TTL runs out instead of being retried on every lookup. This
//! keeps a failing or unauthorized backend from being hammered by a burst of filesystem calls.
//!
//! Generation is serialized per key through a fixed table of async mutexes indexed by the key's
//! hash. Two unrelated keys may land on the same shard and briefly wait on each other; they never
//! share data.

use std::{
    future::Future,
    hash::{Hash as _, Hasher as _},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rustc_hash::FxHasher;
use scc::HashMap as ConcurrentHashMap;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, trace};

use super::eviction::{EvictionHook, NoEviction};

/// Number of generation locks used when no explicit count is given.
pub const DEFAULT_LOCK_SHARDS: usize = 64;

struct Entry<V, E> {
    result: Result<V, E>,
    /// `None` when `now + ttl` does not fit in an [`Instant`]; such entries never expire.
    expires_at: Option<Instant>,
    /// Insertion order. Lets a flush tell a snapshotted entry apart from a later replacement.
    seq: u64,
}

impl<V, E> Entry<V, E> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Concurrent map from string keys to cached results.
///
/// All methods take `&self`. Lookups of live entries never touch the generation locks.
pub struct KeyedCache<V, E, H = NoEviction> {
    entries: ConcurrentHashMap<String, Entry<V, E>>,
    locks: Box<[Mutex<()>]>,
    hook: H,
    sequence: AtomicU64,
}

impl<V, E> KeyedCache<V, E, NoEviction>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a cache without an eviction hook.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_LOCK_SHARDS, NoEviction)
    }
}

impl<V, E> Default for KeyedCache<V, E, NoEviction>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E, H> KeyedCache<V, E, H>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    H: EvictionHook<V, E>,
{
    /// Create a cache which calls `hook` for every entry it removes.
    pub fn with_eviction(hook: H) -> Self {
        Self::with_shards(DEFAULT_LOCK_SHARDS, hook)
    }

    /// Create a cache with `shards` generation locks. A count of zero is treated as one.
    pub fn with_shards(shards: usize, hook: H) -> Self {
        let locks = (0..shards.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            entries: ConcurrentHashMap::new(),
            locks,
            hook,
            sequence: AtomicU64::new(0),
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        reason = "the remainder is bounded by the shard count, which is a usize"
    )]
    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % self.locks.len() as u64) as usize
    }

    async fn lookup(&self, key: &str) -> Option<Result<V, E>> {
        let now = Instant::now();
        self.entries
            .read_async(key, |_, entry| entry.is_live(now).then(|| entry.result.clone()))
            .await
            .flatten()
    }

    /// Return the live result cached under `key`, or compute it with `generate`.
    ///
    /// Concurrent callers for the same key wait for the first caller's generator instead of
    /// running their own, then receive its result. The result is cached for `ttl` whether it
    /// succeeded or not; a cached error is returned as an error.
    pub async fn get_or_update<F, Fut>(&self, key: &str, ttl: Duration, generate: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(cached) = self.lookup(key).await {
            trace!(key, "Cache hit.");
            return cached;
        }

        let _guard = self.locks[self.shard_index(key)].lock().await;

        // Another caller may have populated the entry while we waited on the lock.
        if let Some(cached) = self.lookup(key).await {
            trace!(key, "Cache populated while waiting for the generation lock.");
            return cached;
        }

        debug!(key, ?ttl, "Cache miss, generating.");
        let result = generate().await;
        if result.is_err() {
            debug!(key, ?ttl, "Generator failed, caching the failure.");
        }
        self.store(key, ttl, result.clone()).await;
        result
    }

    /// Return the live result cached under `key`, without generating one.
    pub async fn get(&self, key: &str) -> Option<Result<V, E>> {
        self.lookup(key).await
    }

    /// Unconditionally cache `value` under `key` for `ttl`.
    ///
    /// If an entry is displaced, the eviction hook fires for it.
    pub async fn set(&self, key: &str, ttl: Duration, value: V) {
        self.store(key, ttl, Ok(value)).await;
    }

    async fn store(&self, key: &str, ttl: Duration, result: Result<V, E>) {
        use scc::hash_map::Entry as MapEntry;

        let entry = Entry {
            result,
            expires_at: Instant::now().checked_add(ttl),
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
        };

        let displaced = match self.entries.entry_async(key.to_owned()).await {
            MapEntry::Occupied(mut occ) => Some(std::mem::replace(occ.get_mut(), entry)),
            MapEntry::Vacant(vac) => {
                vac.insert_entry(entry);
                None
            }
        };

        if let Some(old) = displaced {
            trace!(key, "Replaced cache entry.");
            self.hook.evict(key, old.result).await;
        }
    }

    /// Remove the entry for `key`, firing the eviction hook. Returns `true` if one was present.
    pub async fn remove(&self, key: &str) -> bool {
        match self.entries.remove_async(key).await {
            Some((key, entry)) => {
                self.hook.evict(&key, entry.result).await;
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `key` only if `predicate` accepts its stored result, firing the
    /// eviction hook. Returns `true` if an entry was removed.
    pub async fn remove_if<P>(&self, key: &str, predicate: P) -> bool
    where
        P: FnOnce(&Result<V, E>) -> bool,
    {
        let removed = self
            .entries
            .remove_if_async(key, |entry| predicate(&entry.result))
            .await;
        match removed {
            Some((key, entry)) => {
                self.hook.evict(&key, entry.result).await;
                true
            }
            None => false,
        }
    }

    /// Remove every entry, firing the eviction hook once for each.
    ///
    /// Entries are snapshotted first, then evicted live-first and expired-second, each group in
    /// insertion order. An entry replaced after the snapshot is neither removed nor reported.
    pub async fn flush(&self) {
        let now = Instant::now();
        let mut live = Vec::new();
        let mut expired = Vec::new();

        self.entries
            .iter_async(|key, entry| {
                let item = (entry.seq, key.clone());
                if entry.is_live(now) {
                    live.push(item);
                } else {
                    expired.push(item);
                }
                true
            })
            .await;

        live.sort_unstable();
        expired.sort_unstable();

        let evicted = self.evict_snapshot(live.into_iter().chain(expired)).await;
        debug!(evicted, "Flushed cache.");
    }

    /// Remove every expired entry, firing the eviction hook for each. Returns how many were
    /// removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();

        self.entries
            .iter_async(|key, entry| {
                if !entry.is_live(now) {
                    expired.push((entry.seq, key.clone()));
                }
                true
            })
            .await;
        expired.sort_unstable();

        let purged = self.evict_snapshot(expired).await;
        if purged > 0 {
            debug!(purged, "Purged expired cache entries.");
        }
        purged
    }

    async fn evict_snapshot(&self, snapshot: impl IntoIterator<Item = (u64, String)>) -> usize {
        let mut evicted = 0;
        for (seq, key) in snapshot {
            let removed = self
                .entries
                .remove_if_async(&key, |entry| entry.seq == seq)
                .await;
            if let Some((key, entry)) = removed {
                self.hook.evict(&key, entry.result).await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Number of stored entries, including expired ones that have not been swept yet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V, E, H> KeyedCache<V, E, H>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    H: EvictionHook<V, E> + 'static,
{
    /// Spawn a task that calls [`purge_expired`](Self::purge_expired) every `interval`.
    ///
    /// The task holds a weak reference and exits once the cache is dropped.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    trace!("Cache dropped, stopping janitor.");
                    return;
                };
                cache.purge_expired().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::oneshot;

    use super::*;

    fn keys_on_distinct_shards(cache: &KeyedCache<u32, String>) -> (String, String) {
        let first = "key-0".to_owned();
        let shard = cache.shard_index(&first);
        let second = (1..)
            .map(|i| format!("key-{i}"))
            .find(|k| cache.shard_index(k) != shard)
            .unwrap_or_else(|| unreachable!("there is more than one shard"));
        (first, second)
    }

    #[test]
    fn shard_index_is_stable_and_in_range() {
        let cache = KeyedCache::<u32, String>::with_shards(8, NoEviction);
        for i in 0..100 {
            let key = format!("bucket/{i}");
            let idx = cache.shard_index(&key);
            assert!(idx < 8);
            assert_eq!(idx, cache.shard_index(&key));
        }
    }

    #[test]
    fn zero_shards_is_clamped_to_one() {
        let cache = KeyedCache::<u32, String>::with_shards(0, NoEviction);
        assert_eq!(cache.shard_index("anything"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn different_shards_do_not_block_each_other() {
        let cache = Arc::new(KeyedCache::<u32, String>::with_shards(4, NoEviction));
        let (slow_key, fast_key) = keys_on_distinct_shards(&cache);

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let slow = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_update(&slow_key, Duration::from_secs(60), || async move {
                        let _ = release_rx.await;
                        Ok(1)
                    })
                    .await
            })
        };

        // The slow generator holds its shard lock until we release it below, so this only
        // completes if the other key uses a different lock.
        let calls = AtomicUsize::new(0);
        let fast = tokio::time::timeout(
            Duration::from_secs(5),
            cache.get_or_update(&fast_key, Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(2)
            }),
        )
        .await;
        assert_eq!(fast.ok(), Some(Ok(2)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let _ = release_tx.send(());
        assert_eq!(slow.await.ok(), Some(Ok(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_logically_absent() {
        let cache = KeyedCache::<u32, String>::new();
        cache.set("k", Duration::from_secs(1), 7).await;
        assert_eq!(cache.get("k").await, Some(Ok(7)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.len(), 1, "expired entries stay until swept");
    }
}
