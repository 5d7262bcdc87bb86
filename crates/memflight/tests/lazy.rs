// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for `SingleFlightLazyCache`.

use std::{
    sync::{
        Arc,
        atomic::{
            AtomicUsize,
            Ordering::{AcqRel, Acquire},
        },
    },
    time::Duration,
};

use memflight::{BoxError, CancellationToken, Error, InMemoryCache, MemoryCache, SingleFlightLazyCache};
use memflight_tier::testing::{CacheOp, MockMemoryCache};
use tick::{Clock, ClockControl};

const TTL: Duration = Duration::from_secs(300);

async fn panicking_factory() -> Result<u8, BoxError> {
    panic!("factory bug")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_callers_run_the_factory_once() {
    let cache = Arc::new(SingleFlightLazyCache::new(InMemoryCache::new(Clock::new_frozen())));
    let calls = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_create(
                        "user:42".to_string(),
                        TTL,
                        move || async move {
                            calls.fetch_add(1, AcqRel);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, BoxError>(Arc::new("Ferris".to_string()))
                        },
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    let values: Vec<Arc<String>> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("value"))
        .collect();

    assert_eq!(calls.load(Acquire), 1);
    assert!(values.iter().all(|value| Arc::ptr_eq(value, &values[0])));
    assert_eq!(values[0].as_str(), "Ferris");
}

#[tokio::test]
async fn failure_is_shared_until_the_entry_expires() {
    let control = ClockControl::new();
    let cache = SingleFlightLazyCache::new(InMemoryCache::new(control.to_clock()));
    let cancel = CancellationToken::new();
    let ttl = Duration::from_secs(5);

    let first = cache
        .get_or_create("k", ttl, || async { Err::<u32, _>(std::io::Error::other("backend down")) }, &cancel)
        .await;
    let error = first.expect_err("factory failed");
    assert_eq!(
        error.factory_error::<std::io::Error>().map(ToString::to_string).as_deref(),
        Some("backend down")
    );

    let second = cache.get_or_create("k", ttl, || async { Ok::<_, BoxError>(1_u32) }, &cancel).await;
    assert!(second.is_err_and(|error| error.is_factory()));

    control.advance(ttl);
    let third = cache.get_or_create("k", ttl, || async { Ok::<_, BoxError>(2_u32) }, &cancel).await;
    assert_eq!(third.ok(), Some(2));
}

#[tokio::test]
async fn concurrent_waiters_share_one_failure() {
    let cache = SingleFlightLazyCache::new(InMemoryCache::new(Clock::new_frozen()));
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let lookups = (0..10).map(|_| {
        let calls = Arc::clone(&calls);
        cache.get_or_create(
            "k",
            TTL,
            move || async move {
                calls.fetch_add(1, AcqRel);
                tokio::task::yield_now().await;
                Err::<u8, _>("backend down")
            },
            &cancel,
        )
    });

    let outcomes = futures::future::join_all(lookups).await;
    assert!(outcomes.iter().all(|outcome| outcome.as_ref().is_err_and(Error::is_factory)));
    assert_eq!(calls.load(Acquire), 1);
}

#[tokio::test]
async fn panic_is_reported_to_every_waiter() {
    let cache = SingleFlightLazyCache::new(InMemoryCache::new(Clock::new_frozen()));
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        cache.get_or_create("k", TTL, panicking_factory, &cancel),
        cache.get_or_create("k", TTL, || async { Ok::<u8, BoxError>(1) }, &cancel),
    );

    assert!(matches!(a, Err(Error::FactoryPanicked)));
    assert!(matches!(b, Err(Error::FactoryPanicked)));
}

#[tokio::test]
async fn sync_and_async_paths_read_each_other() {
    let cache = SingleFlightLazyCache::new(InMemoryCache::new(Clock::new_frozen()));
    let cancel = CancellationToken::new();

    let stored = cache.get_or_create_sync("sync", TTL, || Ok::<_, BoxError>(10_u32));
    assert_eq!(stored.ok(), Some(10));
    let read = cache
        .get_or_create("sync", TTL, || async { Ok::<_, BoxError>(0_u32) }, &cancel)
        .await;
    assert_eq!(read.ok(), Some(10));

    let stored = cache
        .get_or_create("async", TTL, || async { Ok::<_, BoxError>(20_u32) }, &cancel)
        .await;
    assert_eq!(stored.ok(), Some(20));
    let read = cache.get_or_create_sync("async", TTL, || Ok::<_, BoxError>(0_u32));
    assert_eq!(read.ok(), Some(20));
}

#[tokio::test]
async fn cancelled_waiter_does_not_cancel_the_shared_work() {
    let cache = SingleFlightLazyCache::new(MockMemoryCache::new(Clock::new_frozen()));
    let never = CancellationToken::new();
    let cancel = CancellationToken::new();
    let loser_calls = Arc::new(AtomicUsize::new(0));
    let (release, released) = tokio::sync::oneshot::channel::<()>();

    let leader = cache.get_or_create(
        "k",
        TTL,
        move || async move {
            let _ = released.await;
            Ok::<_, BoxError>(7_u8)
        },
        &never,
    );

    let counter = Arc::clone(&loser_calls);
    let waiter = cache.get_or_create(
        "k",
        TTL,
        move || async move {
            counter.fetch_add(1, AcqRel);
            Ok::<_, BoxError>(8_u8)
        },
        &cancel,
    );

    let driver = async {
        tokio::task::yield_now().await;
        cancel.cancel();
        tokio::task::yield_now().await;
        release.send(()).ok();
    };

    let (leader, waiter, ()) = tokio::join!(leader, waiter, driver);

    assert_eq!(leader.ok(), Some(7));
    assert!(waiter.is_err_and(|error| error.is_cancelled()));
    assert_eq!(loser_calls.load(Acquire), 0);

    let again = cache.get_or_create("k", TTL, || async { Ok::<_, BoxError>(9_u8) }, &never).await;
    assert_eq!(again.ok(), Some(7));
}

#[tokio::test]
async fn hit_reads_the_cache_once() {
    let mock = MockMemoryCache::new(Clock::new_frozen());
    let cache = SingleFlightLazyCache::new(mock.clone());
    let cancel = CancellationToken::new();

    let _ = cache.get_or_create("k", TTL, || async { Ok::<_, BoxError>(1_u8) }, &cancel).await;
    assert_eq!(mock.operations(), vec![CacheOp::TryGet("k"), CacheOp::GetOrInsert("k")]);

    mock.clear_operations();
    let _ = cache.get_or_create("k", TTL, || async { Ok::<_, BoxError>(2_u8) }, &cancel).await;
    assert_eq!(mock.operations(), vec![CacheOp::TryGet("k")]);
}

#[tokio::test]
async fn cancelled_token_fails_before_reading() {
    let mock = MockMemoryCache::new(Clock::new_frozen());
    let cache = SingleFlightLazyCache::new(mock.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = cache.get_or_create("k", TTL, || async { Ok::<_, BoxError>(1_u8) }, &cancel).await;

    assert!(outcome.is_err_and(|error| error.is_cancelled()));
    assert!(mock.operations().is_empty());
    assert_eq!(mock.len(), Some(0));
}
