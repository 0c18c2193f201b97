#![allow(clippy::unwrap_used, missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gatefs::cache::SingleValueCache;
use tokio::task::JoinSet;

#[tokio::test(start_paused = true)]
async fn update_reuses_a_valid_value() {
    let cache = SingleValueCache::new(Duration::from_secs(10));
    cache.set(vec!["a.txt".to_owned()]);

    let listing: Result<_, ()> = cache
        .update(|| async { panic!("compute must not run while the value is valid") })
        .await;
    assert_eq!(listing.unwrap(), vec!["a.txt".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn update_recomputes_after_expiry() {
    let cache = SingleValueCache::new(Duration::from_secs(10));
    cache.set(1u32);
    tokio::time::advance(Duration::from_secs(11)).await;

    let v: Result<u32, ()> = cache.update(|| async { Ok(2) }).await;
    assert_eq!(v, Ok(2));
    assert_eq!(cache.get(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn failures_are_not_cached() {
    let cache = SingleValueCache::<u32>::new(Duration::from_secs(10));
    let calls = AtomicUsize::new(0);

    let first: Result<u32, &str> = cache
        .update(|| async {
            calls.fetch_add(1, Ordering::Relaxed);
            Err("throttled")
        })
        .await;
    assert_eq!(first, Err("throttled"));
    assert_eq!(cache.get(), None, "a failure must not be stored");

    let second: Result<u32, &str> = cache
        .update(|| async {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(7)
        })
        .await;
    assert_eq!(second, Ok(7));
    assert_eq!(
        calls.load(Ordering::Relaxed),
        2,
        "the call right after a failure should retry immediately"
    );
}

#[tokio::test(start_paused = true)]
async fn failed_update_keeps_later_value_readable() {
    let cache = SingleValueCache::new(Duration::from_secs(10));
    cache.set(1u32);
    tokio::time::advance(Duration::from_secs(11)).await;

    let result: Result<u32, &str> = cache.update(|| async { Err("offline") }).await;
    assert!(result.is_err());

    cache.set(3);
    let result: Result<u32, &str> = cache.update(|| async { Err("offline") }).await;
    assert_eq!(result, Ok(3), "a valid value short-circuits compute");
    assert_eq!(cache.get(), Some(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_collapse() {
    let cache = Arc::new(SingleValueCache::new(Duration::from_secs(60)));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut set = JoinSet::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        set.spawn(async move {
            cache
                .update(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, ()>("object-listing")
                })
                .await
        });
    }

    while let Some(result) = set.join_next().await {
        assert_eq!(result.unwrap(), Ok("object-listing"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "compute should run once");
}
