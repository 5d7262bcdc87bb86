// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-flight population that keeps the in-flight handle in the cache itself.

use std::{fmt::Debug, hash::Hash, marker::PhantomData, sync::Arc, time::Duration};

use memflight_tier::{CacheValue, EntryOptions, MemoryCache, downcast_ref, erase};
use tokio_util::sync::CancellationToken;

use crate::{
    BoxError, Error, Result,
    flight::{Flight, run_factory},
    telemetry::{CacheActivity, Component, emit},
};

/// Populates a cache by storing a shared [`Flight`] as the key's value.
///
/// On a miss, the caller asks the cache to atomically install a handle wrapping
/// its factory. The cache keeps exactly one handle per key; every caller, the
/// winner included, then awaits the handle that was kept. Losing handles are
/// never polled, so their factories never run.
///
/// The handle stays cached after it completes. Readers that find a completed
/// handle get its outcome without suspending, and a failure is served to every
/// reader of the key until the entry expires or is replaced.
///
/// This relies on [`MemoryCache::get_or_insert_with`] being atomic per key, which
/// holds for `InMemoryCache` and `MockMemoryCache`. With the default
/// read-then-write implementation two racing callers may each run their factory.
///
/// A value stored directly as a `T`, for example by
/// [`get_or_create_sync`](Self::get_or_create_sync), is a hit for the async path
/// too.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use memflight::{CancellationToken, InMemoryCache, SingleFlightLazyCache};
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> memflight::Result<()> {
/// let cache = SingleFlightLazyCache::new(InMemoryCache::new(Clock::new_frozen()));
/// let ttl = Duration::from_secs(60);
///
/// let sync = cache.get_or_create_sync("answer", ttl, || Ok::<_, std::io::Error>(42_u32))?;
/// let lazy = cache
///     .get_or_create("answer", ttl, || async { Ok::<_, std::io::Error>(0_u32) }, &CancellationToken::new())
///     .await?;
///
/// assert_eq!((sync, lazy), (42, 42));
/// # Ok(())
/// # }
/// ```
pub struct SingleFlightLazyCache<K, C> {
    cache: C,
    _key: PhantomData<fn(K)>,
}

impl<K, C: Debug> Debug for SingleFlightLazyCache<K, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightLazyCache").field("cache", &self.cache).finish()
    }
}

impl<K, C> SingleFlightLazyCache<K, C>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    C: MemoryCache<K>,
{
    /// Wraps `cache`.
    #[must_use]
    pub fn new(cache: C) -> Self {
        Self { cache, _key: PhantomData }
    }

    /// The decorated cache.
    #[must_use]
    pub fn inner(&self) -> &C {
        &self.cache
    }

    /// Returns the `T` for `key`, awaiting the cached handle or installing a new one
    /// that runs `factory`. The entry lives for `ttl`.
    ///
    /// The factory runs on its own Tokio task, so it completes even if every
    /// caller stops waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when `cancel` fires first, and the shared
    /// outcome of the handle otherwise.
    pub async fn get_or_create<T, F, Fut, E>(&self, key: K, ttl: Duration, factory: F, cancel: &CancellationToken) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.get_or_create_configured(key, ttl, |_| {}, factory, cancel).await
    }

    /// Like [`get_or_create`](Self::get_or_create), with `configure` applied to the
    /// options of a newly installed entry.
    ///
    /// # Errors
    ///
    /// Same as [`get_or_create`](Self::get_or_create).
    pub async fn get_or_create_configured<T, G, F, Fut, E>(
        &self,
        key: K,
        ttl: Duration,
        configure: G,
        factory: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        G: FnOnce(&mut EntryOptions<K>),
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(value) = self.cache.try_get(&key) {
            match resolve::<T>(&value) {
                Resolved::Value(value) => {
                    emit(Component::Lazy, CacheActivity::Hit, &key);
                    return Ok(value);
                }
                Resolved::Pending(flight) => {
                    emit(Component::Lazy, CacheActivity::Joined, &key);
                    return flight.wait(cancel).await;
                }
                Resolved::Other => emit(Component::Lazy, CacheActivity::Uncoalesced, &key),
            }
        }

        emit(Component::Lazy, CacheActivity::Miss, &key);

        let candidate = Flight::spawned(run_factory(factory));
        let erased = erase(candidate.clone());
        let mut options = EntryOptions::new().with_time_to_live(ttl);
        configure(&mut options);

        let mut installed = false;
        let value = self.cache.get_or_insert_with(
            key.clone(),
            &mut |value: &CacheValue| !matches!(resolve::<T>(value), Resolved::Other),
            &mut || {
                installed = true;
                (Arc::clone(&erased), options.clone())
            },
        );

        let flight = match resolve::<T>(&value) {
            Resolved::Value(value) => return Ok(value),
            Resolved::Pending(flight) => flight,
            Resolved::Other => candidate,
        };

        if installed {
            emit(Component::Lazy, CacheActivity::Populated, &key);
        } else {
            emit(Component::Lazy, CacheActivity::Joined, &key);
        }

        flight.wait(cancel).await
    }

    /// Returns the `T` for `key` without suspending, running `factory` on this thread
    /// when no outcome is available yet.
    ///
    /// A stored value or a completed handle is returned as is. A miss, or a handle
    /// that is still running, makes this caller run `factory` and store the plain
    /// value for `ttl`, replacing the handle. Callers already awaiting the replaced
    /// handle still receive its outcome.
    ///
    /// # Errors
    ///
    /// Returns the outcome of a completed handle, or [`Error::Factory`] when
    /// `factory` fails. Failures of this path are not cached.
    pub fn get_or_create_sync<T, F, E>(&self, key: K, ttl: Duration, factory: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> std::result::Result<T, E>,
        E: Into<BoxError>,
    {
        if let Some(value) = self.cache.try_get(&key) {
            match resolve::<T>(&value) {
                Resolved::Value(value) => {
                    emit(Component::Lazy, CacheActivity::Hit, &key);
                    return Ok(value);
                }
                Resolved::Pending(flight) => {
                    if let Some(outcome) = flight.peek() {
                        emit(Component::Lazy, CacheActivity::Hit, &key);
                        return outcome;
                    }
                }
                Resolved::Other => {}
            }
        }

        emit(Component::Lazy, CacheActivity::Miss, &key);
        let value = factory().map_err(Error::factory)?;
        self.cache.set(key, erase(value.clone()), EntryOptions::new().with_time_to_live(ttl));
        Ok(value)
    }
}

enum Resolved<T> {
    Value(T),
    Pending(Flight<T>),
    Other,
}

fn resolve<T>(value: &CacheValue) -> Resolved<T>
where
    T: Clone + 'static,
{
    if let Some(value) = downcast_ref::<T>(value) {
        return Resolved::Value(value.clone());
    }

    downcast_ref::<Flight<T>>(value).map_or(Resolved::Other, |flight| Resolved::Pending(flight.clone()))
}

#[cfg(test)]
mod tests {
    use memflight_tier::testing::MockMemoryCache;
    use tick::Clock;

    use super::*;

    #[test]
    fn resolve_distinguishes_values_handles_and_others() {
        assert!(matches!(resolve::<u8>(&erase(1_u8)), Resolved::Value(1)));
        assert!(matches!(resolve::<u8>(&erase("text")), Resolved::Other));

        let flight = Flight::inline(async { Ok(2_u8) });
        assert!(matches!(resolve::<u8>(&erase(flight)), Resolved::Pending(_)));
    }

    #[tokio::test]
    async fn handle_is_the_cached_value() {
        let mock = MockMemoryCache::new(Clock::new_frozen());
        let cache = SingleFlightLazyCache::new(mock.clone());

        let value = cache
            .get_or_create("k", Duration::from_secs(5), || async { Ok::<_, BoxError>(3_u16) }, &CancellationToken::new())
            .await;
        assert_eq!(value.ok(), Some(3));

        let stored = mock.try_get(&"k").expect("entry stored");
        let flight = downcast_ref::<Flight<u16>>(&stored).expect("a handle is stored");
        assert_eq!(flight.peek().and_then(Result::ok), Some(3));
    }

    #[test]
    fn sync_path_replaces_pending_handle() {
        let mock = MockMemoryCache::new(Clock::new_frozen());
        mock.insert("k", Flight::inline(std::future::pending::<Result<u8>>()), EntryOptions::new());
        let cache = SingleFlightLazyCache::new(mock.clone());

        let value = cache.get_or_create_sync("k", Duration::from_secs(5), || Ok::<_, BoxError>(4_u8));

        assert_eq!(value.ok(), Some(4));
        assert_eq!(mock.get::<u8>(&"k"), Some(4));
    }
}
