// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hit and miss paths of each decorator over the moka-backed cache.

#![allow(
    clippy::items_after_statements,
    clippy::unwrap_used,
    missing_docs,
    reason = "Benchmarks have relaxed requirements"
)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use criterion::{Criterion, criterion_group, criterion_main};
use memflight::{
    BoxError, CancellationToken, CoalescingMemoryCache, InMemoryCache, MemoryCache, SingleFlightCache, SingleFlightLazyCache,
    SwrCache, SwrOptions,
};
use tick::Clock;

const TTL: Duration = Duration::from_secs(300);

fn bench_hits(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();
    let cancel = CancellationToken::new();
    let mut group = c.benchmark_group("hit");

    let raw = InMemoryCache::<u64>::new(Clock::new_tokio());
    raw.insert(1, 42_u64, memflight::EntryOptions::new());
    group.bench_function("raw", |b| b.iter(|| raw.get::<u64>(&1)));

    let single = SingleFlightCache::new(InMemoryCache::new(Clock::new_tokio()));
    rt.block_on(single.get_or_create(1_u64, TTL, || async { Ok::<_, BoxError>(42_u64) }, &cancel))
        .unwrap();
    group.bench_function("single_flight", |b| {
        b.to_async(&rt)
            .iter(|| single.get_or_create(1_u64, TTL, || async { Ok::<_, BoxError>(0_u64) }, &cancel));
    });

    let lazy = SingleFlightLazyCache::new(InMemoryCache::new(Clock::new_tokio()));
    rt.block_on(lazy.get_or_create(1_u64, TTL, || async { Ok::<_, BoxError>(42_u64) }, &cancel))
        .unwrap();
    group.bench_function("lazy", |b| {
        b.to_async(&rt)
            .iter(|| lazy.get_or_create(1_u64, TTL, || async { Ok::<_, BoxError>(0_u64) }, &cancel));
    });

    let coalescing = CoalescingMemoryCache::new(InMemoryCache::new(Clock::new_tokio()));
    rt.block_on(coalescing.get_or_create(1_u64, || async { Ok::<_, BoxError>(42_u64) }))
        .unwrap();
    group.bench_function("coalescing", |b| {
        b.to_async(&rt)
            .iter(|| coalescing.get_or_create(1_u64, || async { Ok::<_, BoxError>(0_u64) }));
    });

    let clock = Clock::new_tokio();
    let swr = SwrCache::new(Arc::new(InMemoryCache::new(clock.clone())), clock);
    let options = SwrOptions::new(TTL, TTL);
    rt.block_on(swr.get_or_create(1_u64, options, || async { Ok::<_, BoxError>(42_u64) }, &cancel))
        .unwrap();
    group.bench_function("swr", |b| {
        b.to_async(&rt)
            .iter(|| swr.get_or_create(1_u64, options, || async { Ok::<_, BoxError>(0_u64) }, &cancel));
    });

    group.finish();
}

// Every iteration uses a fresh key, so each call runs its factory.
fn bench_misses(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();
    let cancel = CancellationToken::new();
    let mut group = c.benchmark_group("miss");

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let next_key = || COUNTER.fetch_add(1, Ordering::Relaxed);

    let single = SingleFlightCache::new(InMemoryCache::new(Clock::new_tokio()));
    group.bench_function("single_flight", |b| {
        b.to_async(&rt)
            .iter(|| single.get_or_create(next_key(), TTL, || async { Ok::<_, BoxError>(1_u64) }, &cancel));
    });

    let lazy = SingleFlightLazyCache::new(InMemoryCache::new(Clock::new_tokio()));
    group.bench_function("lazy", |b| {
        b.to_async(&rt)
            .iter(|| lazy.get_or_create(next_key(), TTL, || async { Ok::<_, BoxError>(1_u64) }, &cancel));
    });

    let coalescing = CoalescingMemoryCache::new(InMemoryCache::new(Clock::new_tokio()));
    group.bench_function("coalescing", |b| {
        b.to_async(&rt)
            .iter(|| coalescing.get_or_create(next_key(), || async { Ok::<_, BoxError>(1_u64) }));
    });
    group.bench_function("coalescing_inline", |b| {
        b.to_async(&rt)
            .iter(|| coalescing.get_or_create_inline(next_key(), || async { Ok::<_, BoxError>(1_u64) }));
    });

    group.finish();
}

criterion_group!(benches, bench_hits, bench_misses);
criterion_main!(benches);
