// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stampede protection
//!
//! Many tasks ask for the same uncached key at once. Each decorator lets only
//! one of them call the slow backend; the rest wait and share the result.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use memflight::{BoxError, CancellationToken, CoalescingMemoryCache, InMemoryCache, SingleFlightCache, SingleFlightLazyCache};
use tick::Clock;

const TASKS: usize = 10;
const TTL: Duration = Duration::from_secs(60);

/// A slow backend that counts how many times it's called.
#[derive(Debug, Clone)]
struct SlowBackend {
    calls: Arc<AtomicU32>,
    latency: Duration,
}

impl SlowBackend {
    fn new(latency: Duration) -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            latency,
        }
    }

    async fn load(self, key: String) -> Result<String, BoxError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        Ok(format!("value_for_{key}"))
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let clock = Clock::new_tokio();
    let key = "contested_key".to_string();

    // Gate: one task runs the factory, the others re-read the cache after it.
    let backend = SlowBackend::new(Duration::from_millis(100));
    let cache = Arc::new(SingleFlightCache::new(InMemoryCache::new(clock.clone())));
    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let (cache, backend, key) = (Arc::clone(&cache), backend.clone(), key.clone());
            tokio::spawn(async move {
                let loader = key.clone();
                cache
                    .get_or_create(key, TTL, move || backend.load(loader), &CancellationToken::new())
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }
    tracing::info!(calls = backend.calls(), "single flight");

    // Lazy: the in-flight handle itself is the cached value.
    let backend = SlowBackend::new(Duration::from_millis(100));
    let cache = Arc::new(SingleFlightLazyCache::new(InMemoryCache::new(clock.clone())));
    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let (cache, backend, key) = (Arc::clone(&cache), backend.clone(), key.clone());
            tokio::spawn(async move {
                let loader = key.clone();
                cache
                    .get_or_create(key, TTL, move || backend.load(loader), &CancellationToken::new())
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }
    tracing::info!(calls = backend.calls(), "lazy single flight");

    // Coalescing: in-flight handles live in a registry next to the cache.
    let backend = SlowBackend::new(Duration::from_millis(100));
    let cache = Arc::new(CoalescingMemoryCache::new(InMemoryCache::new(clock.clone())));
    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let (cache, backend, key) = (Arc::clone(&cache), backend.clone(), key.clone());
            tokio::spawn(async move {
                let loader = key.clone();
                cache.get_or_create(key, move || backend.load(loader)).await
            })
        })
        .collect();
    for handle in handles {
        let _value: String = handle.await??;
    }
    tracing::info!(calls = backend.calls(), "coalescing");

    Ok(())
}
