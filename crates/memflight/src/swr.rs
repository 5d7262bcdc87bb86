// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stale-while-revalidate reads with at most one background refresh per key.

use std::{
    fmt::Debug,
    hash::Hash,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use futures::FutureExt;
use memflight_tier::{EntryOptions, MemoryCache, erase};
use tick::Clock;
use tokio_util::sync::CancellationToken;

use crate::{
    BoxError, Error, Result,
    flight::{Deregister, Flight, InFlight, Joined, run_factory},
    telemetry::{CacheActivity, Component, emit, emit_refresh_failure},
};

/// How long a value is fresh, and how long it may be served stale afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwrOptions {
    ttl: Duration,
    stale: Duration,
}

impl SwrOptions {
    /// Values are fresh for `ttl`, then served stale for up to `stale` while they
    /// are refreshed in the background.
    #[must_use]
    pub const fn new(ttl: Duration, stale: Duration) -> Self {
        Self { ttl, stale }
    }

    /// The time a value stays fresh.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The window after `ttl` during which a stale value is still served.
    #[must_use]
    pub const fn stale(&self) -> Duration {
        self.stale
    }

    /// Checks the options and returns the total lifetime of a stored value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] when `ttl` is zero or the total lifetime
    /// does not fit in a [`Duration`].
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use memflight::SwrOptions;
    ///
    /// let options = SwrOptions::new(Duration::from_millis(100), Duration::from_millis(200));
    /// assert_eq!(options.validate()?, Duration::from_millis(300));
    ///
    /// assert!(SwrOptions::new(Duration::ZERO, Duration::from_secs(1)).validate().is_err());
    /// # Ok::<(), memflight::Error>(())
    /// ```
    pub fn validate(&self) -> Result<Duration> {
        if self.ttl.is_zero() {
            return Err(Error::InvalidOptions("time-to-live must be positive"));
        }

        self.ttl
            .checked_add(self.stale)
            .ok_or(Error::InvalidOptions("time-to-live plus stale window overflows"))
    }
}

/// A stored value with its freshness state.
struct SwrBox<T> {
    value: T,
    stored_at: Instant,
    ttl: Duration,
    refreshing: AtomicBool,
}

impl<T> SwrBox<T> {
    fn new(value: T, stored_at: Instant, ttl: Duration) -> Self {
        Self {
            value,
            stored_at,
            ttl,
            refreshing: AtomicBool::new(false),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }

    fn try_start_refresh(&self) -> bool {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Ends a background refresh. Unless disarmed, the stale box becomes eligible
/// for another refresh.
struct RefreshGuard<T> {
    stale: Option<Arc<SwrBox<T>>>,
    running: Arc<AtomicUsize>,
}

impl<T> RefreshGuard<T> {
    fn disarm(&mut self) {
        self.stale = None;
    }
}

impl<T> Drop for RefreshGuard<T> {
    fn drop(&mut self) {
        if let Some(stale) = self.stale.take() {
            stale.refreshing.store(false, Ordering::Release);
        }
        self.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Serves cached values stale while refreshing them in the background.
///
/// Each value is stored with the time it was produced and kept in the cache for
/// `ttl + stale`. A read within `ttl` of that time is a fresh hit. A later read
/// returns the stale value immediately and starts a background refresh, unless
/// one is already running for that value. A successful refresh stores a new
/// value; a failed one is logged and leaves the stale value in place for the
/// next read to retry. Refresh outcomes never reach a caller.
///
/// A read that finds nothing runs the factory in the foreground. Concurrent
/// foreground misses for one key share a single factory run.
///
/// Background refreshes are spawned on the current Tokio runtime.
///
/// # Examples
///
/// ```
/// use std::{sync::Arc, time::Duration};
///
/// use memflight::{CancellationToken, InMemoryCache, SwrCache, SwrOptions};
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> memflight::Result<()> {
/// let clock = Clock::new_frozen();
/// let cache = SwrCache::new(Arc::new(InMemoryCache::new(clock.clone())), clock);
/// let options = SwrOptions::new(Duration::from_secs(60), Duration::from_secs(600));
///
/// let rate = cache
///     .get_or_create("eur/usd", options, || async { Ok::<_, std::io::Error>(1.08_f64) }, &CancellationToken::new())
///     .await?;
///
/// assert!((rate - 1.08).abs() < f64::EPSILON);
/// # Ok(())
/// # }
/// ```
pub struct SwrCache<K, C> {
    cache: Arc<C>,
    clock: Clock,
    misses: Arc<InFlight<K>>,
    refreshes: Arc<AtomicUsize>,
}

impl<K, C> Debug for SwrCache<K, C>
where
    K: Eq + Hash,
    C: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwrCache")
            .field("cache", &self.cache)
            .field("misses", &self.misses)
            .field("refreshes", &self.refreshes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<K, C> SwrCache<K, C>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    C: MemoryCache<K> + 'static,
{
    /// Wraps `cache`, measuring freshness on `clock`.
    ///
    /// Use the clock the cache itself expires entries on.
    #[must_use]
    pub fn new(cache: Arc<C>, clock: Clock) -> Self {
        Self {
            cache,
            clock,
            misses: Arc::new(InFlight::new()),
            refreshes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The decorated cache.
    #[must_use]
    pub fn inner(&self) -> &Arc<C> {
        &self.cache
    }

    /// The number of background refreshes currently running.
    #[must_use]
    pub fn refreshes_in_flight(&self) -> usize {
        self.refreshes.load(Ordering::Acquire)
    }

    /// The number of keys with a foreground miss in progress.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.misses.len()
    }

    /// Returns the value for `key`, fresh or stale, running `factory` in the
    /// foreground only when nothing is cached.
    ///
    /// On a stale read `factory` becomes the background refresh; it is not
    /// affected by `cancel`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOptions`] for invalid `options`, [`Error::Cancelled`]
    /// when `cancel` fires before a foreground miss completes, and the factory's
    /// failure for a foreground miss.
    pub async fn get_or_create<T, F, Fut, E>(&self, key: K, options: SwrOptions, factory: F, cancel: &CancellationToken) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let total = options.validate()?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(boxed) = self.cache.try_get(&key).and_then(|value| value.downcast::<SwrBox<T>>().ok()) {
            let value = boxed.value.clone();

            if boxed.is_fresh(self.clock.instant()) {
                emit(Component::Swr, CacheActivity::Hit, &key);
            } else {
                emit(Component::Swr, CacheActivity::StaleHit, &key);
                self.refresh(key, boxed, options.ttl, total, factory);
            }

            return Ok(value);
        }

        let joined = self.misses.join_or_start(&key, |id| {
            let deregister = Deregister::new(Arc::clone(&self.misses), key.clone(), id);
            let cache = Arc::clone(&self.cache);
            let clock = self.clock.clone();
            let key = key.clone();

            Flight::spawned(async move {
                let _deregister = deregister;

                if let Some(boxed) = cache.try_get(&key).and_then(|value| value.downcast::<SwrBox<T>>().ok()) {
                    return Ok(boxed.value.clone());
                }

                let value = run_factory(factory).await?;
                store(&*cache, &clock, key, value.clone(), options.ttl, total);
                Ok(value)
            })
        });

        let flight = match joined {
            Joined::Leader(flight) => {
                emit(Component::Swr, CacheActivity::Miss, &key);
                flight
            }
            Joined::Follower(flight) => {
                emit(Component::Swr, CacheActivity::Joined, &key);
                flight
            }
            Joined::Uncoalesced(flight) => {
                emit(Component::Swr, CacheActivity::Uncoalesced, &key);
                flight
            }
        };

        flight.wait(cancel).await
    }

    fn refresh<T, F, Fut, E>(&self, key: K, stale: Arc<SwrBox<T>>, ttl: Duration, total: Duration, factory: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        if !stale.try_start_refresh() {
            return;
        }

        self.refreshes.fetch_add(1, Ordering::AcqRel);
        let mut guard = RefreshGuard {
            stale: Some(stale),
            running: Arc::clone(&self.refreshes),
        };

        emit(Component::Swr, CacheActivity::RefreshScheduled, &key);

        let cache = Arc::clone(&self.cache);
        let clock = self.clock.clone();

        drop(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(run_factory(factory))
                .catch_unwind()
                .await
                .unwrap_or(Err(Error::FactoryPanicked));

            match outcome {
                Ok(value) => {
                    store(&*cache, &clock, key.clone(), value, ttl, total);
                    guard.disarm();
                    emit(Component::Swr, CacheActivity::Refreshed, &key);
                }
                Err(error) => emit_refresh_failure(&key, &error),
            }

            drop(guard);
        }));
    }
}

fn store<K, C, T>(cache: &C, clock: &Clock, key: K, value: T, ttl: Duration, total: Duration)
where
    C: MemoryCache<K> + ?Sized,
    T: Send + Sync + 'static,
{
    let boxed = SwrBox::new(value, clock.instant(), ttl);
    cache.set(key, erase(boxed), EntryOptions::new().with_time_to_live(total));
}
