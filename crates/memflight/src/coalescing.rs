// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A drop-in cache decorator that coalesces cold-miss population.

use std::{fmt::Debug, hash::Hash, sync::Arc};

use memflight_tier::{CacheEntry, CacheValue, EntryOptions, EvictionCallback, EvictionSubscription, MemoryCache};
use tokio_util::sync::CancellationToken;

use crate::{
    BoxError, Error, Result,
    flight::{Deregister, Flight, InFlight, Joined, run_factory},
    telemetry::{CacheActivity, Component, emit},
};

/// The value returned by [`CoalescingMemoryCache::get_or_create_with_cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coalesced<T> {
    /// The value.
    pub value: T,
    /// `true` when this call started the shared population; `false` when it found
    /// the value cached or joined a population started by another call.
    pub leader: bool,
}

#[derive(Debug, Clone, Copy)]
enum Launch {
    Spawned,
    Inline,
}

/// A [`MemoryCache`] that runs at most one factory per missing key.
///
/// Reads that find a value in the inner cache return it directly. On a miss, the
/// first caller registers a shared [`Flight`] for the key in a registry kept next
/// to the cache, and every concurrent caller for that key awaits it. A failure is
/// therefore seen by every caller waiting on the flight. The registry entry is
/// removed as soon as the flight completes, so later misses start over.
///
/// The flight checks the inner cache once more before running the factory, which
/// covers values written directly through [`MemoryCache::set`] in the meantime.
/// Values are committed through [`MemoryCache::create_entry`] with the decorator's
/// default options.
///
/// Every other [`MemoryCache`] operation forwards to the inner cache unchanged.
/// Dropping a decorator built with [`new`](Self::new) clears the inner cache.
///
/// # Examples
///
/// ```
/// use memflight::{CoalescingMemoryCache, InMemoryCache};
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> memflight::Result<()> {
/// let cache = CoalescingMemoryCache::new(InMemoryCache::new(Clock::new_frozen()));
///
/// let profile = cache
///     .get_or_create("user:42".to_string(), || async { Ok::<_, std::io::Error>("Ferris".to_string()) })
///     .await?;
///
/// assert_eq!(profile, "Ferris");
/// assert_eq!(cache.in_flight(), 0);
/// # Ok(())
/// # }
/// ```
pub struct CoalescingMemoryCache<K, C>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    C: MemoryCache<K>,
{
    inner: Arc<C>,
    in_flight: Arc<InFlight<K>>,
    default_options: EntryOptions<K>,
    dispose_inner: bool,
}

impl<K, C> Debug for CoalescingMemoryCache<K, C>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    C: MemoryCache<K> + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingMemoryCache")
            .field("inner", &self.inner)
            .field("in_flight", &self.in_flight)
            .field("dispose_inner", &self.dispose_inner)
            .finish_non_exhaustive()
    }
}

impl<K, C> CoalescingMemoryCache<K, C>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    C: MemoryCache<K> + 'static,
{
    /// Wraps `inner`, taking ownership of it. The inner cache is cleared when the
    /// decorator is dropped.
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self::from_shared(Arc::new(inner), true)
    }

    /// Wraps a shared inner cache. When `dispose_inner` is set, the inner cache is
    /// cleared when the decorator is dropped.
    #[must_use]
    pub fn from_shared(inner: Arc<C>, dispose_inner: bool) -> Self {
        Self {
            inner,
            in_flight: Arc::new(InFlight::new()),
            default_options: EntryOptions::new(),
            dispose_inner,
        }
    }

    /// Sets the options every coalesced value is committed with.
    #[must_use]
    pub fn with_default_options(mut self, options: EntryOptions<K>) -> Self {
        self.default_options = options;
        self
    }

    /// The decorated cache.
    #[must_use]
    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    /// The number of keys with a population in progress.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns the `T` cached for `key`, or the outcome of the shared population
    /// running `factory`. The factory runs on its own Tokio task.
    ///
    /// # Errors
    ///
    /// Returns the shared [`Error::Factory`] or [`Error::FactoryPanicked`] outcome
    /// when the population fails.
    pub async fn get_or_create<T, F, Fut, E>(&self, key: K, factory: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let never = CancellationToken::new();
        let coalesced = self.coalesce(key, Launch::Spawned, run_factory(factory), &never).await?;
        Ok(coalesced.value)
    }

    /// Like [`get_or_create`](Self::get_or_create), but the factory is polled by the
    /// callers awaiting it instead of a separate task.
    ///
    /// A factory whose future is ready on its first poll completes without
    /// suspending anybody. The factory only makes progress while at least one
    /// caller awaits it. Once every caller has stopped waiting the factory is
    /// dropped, and the next call for the key starts a new one.
    ///
    /// # Errors
    ///
    /// Same as [`get_or_create`](Self::get_or_create).
    pub async fn get_or_create_inline<T, F, Fut, E>(&self, key: K, factory: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let never = CancellationToken::new();
        let coalesced = self.coalesce(key, Launch::Inline, run_factory(factory), &never).await?;
        Ok(coalesced.value)
    }

    /// Like [`get_or_create`](Self::get_or_create), with a synchronous factory run by
    /// the first caller to poll the shared population.
    ///
    /// # Errors
    ///
    /// Same as [`get_or_create`](Self::get_or_create).
    pub async fn get_or_create_sync<T, F, E>(&self, key: K, factory: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let never = CancellationToken::new();
        let body = async move { factory().map_err(Error::factory) };
        let coalesced = self.coalesce(key, Launch::Inline, body, &never).await?;
        Ok(coalesced.value)
    }

    /// Like [`get_or_create`](Self::get_or_create), and reports whether this call
    /// started the population.
    ///
    /// `cancel` only ends this caller's wait. The population keeps running for
    /// every other caller and still commits its value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when `cancel` fires before the value is
    /// available, otherwise the same errors as [`get_or_create`](Self::get_or_create).
    pub async fn get_or_create_with_cancel<T, F, Fut, E>(&self, key: K, factory: F, cancel: &CancellationToken) -> Result<Coalesced<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.coalesce(key, Launch::Spawned, run_factory(factory), cancel).await
    }

    async fn coalesce<T, B>(&self, key: K, launch: Launch, body: B, cancel: &CancellationToken) -> Result<Coalesced<T>>
    where
        T: Clone + Send + Sync + 'static,
        B: Future<Output = Result<T>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(value) = self.inner.get::<T>(&key) {
            emit(Component::Coalescing, CacheActivity::Hit, &key);
            return Ok(Coalesced { value, leader: false });
        }

        let joined = self.in_flight.join_or_start(&key, |id| {
            let deregister = Deregister::new(Arc::clone(&self.in_flight), key.clone(), id);
            let inner = Arc::clone(&self.inner);
            let options = self.default_options.clone();
            let key = key.clone();

            let task = async move {
                let _deregister = deregister;

                if let Some(value) = inner.get::<T>(&key) {
                    return Ok(value);
                }

                let value = body.await?;

                let mut entry = inner.create_entry(key);
                *entry.options_mut() = options;
                entry.set_value(value.clone());
                entry.commit();
                Ok(value)
            };

            match launch {
                Launch::Spawned => Flight::spawned(task),
                Launch::Inline => Flight::inline(task),
            }
        });

        let (flight, leader) = match joined {
            Joined::Leader(flight) => {
                emit(Component::Coalescing, CacheActivity::Miss, &key);
                (flight, true)
            }
            Joined::Follower(flight) => {
                emit(Component::Coalescing, CacheActivity::Joined, &key);
                (flight, false)
            }
            Joined::Uncoalesced(flight) => {
                emit(Component::Coalescing, CacheActivity::Uncoalesced, &key);
                (flight, true)
            }
        };

        let value = flight.wait(cancel).await?;
        Ok(Coalesced { value, leader })
    }
}

impl<K, C> MemoryCache<K> for CoalescingMemoryCache<K, C>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    C: MemoryCache<K>,
{
    fn try_get(&self, key: &K) -> Option<CacheValue> {
        self.inner.try_get(key)
    }

    fn set(&self, key: K, value: CacheValue, options: EntryOptions<K>) {
        self.inner.set(key, value, options);
    }

    fn remove(&self, key: &K) {
        self.inner.remove(key);
    }

    fn subscribe_evictions(&self, callback: EvictionCallback<K>) -> EvictionSubscription {
        self.inner.subscribe_evictions(callback)
    }

    fn clear(&self) {
        self.inner.clear();
    }

    fn create_entry(&self, key: K) -> CacheEntry<'_, K> {
        self.inner.create_entry(key)
    }

    fn get_or_insert_with(
        &self,
        key: K,
        accept: &mut dyn FnMut(&CacheValue) -> bool,
        init: &mut dyn FnMut() -> (CacheValue, EntryOptions<K>),
    ) -> CacheValue {
        self.inner.get_or_insert_with(key, accept, init)
    }

    fn len(&self) -> Option<u64> {
        self.inner.len()
    }
}

impl<K, C> Drop for CoalescingMemoryCache<K, C>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    C: MemoryCache<K>,
{
    fn drop(&mut self) {
        if self.dispose_inner {
            self.inner.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use memflight_tier::testing::{CacheOp, MockMemoryCache};
    use tick::Clock;

    use super::*;

    #[tokio::test]
    async fn commits_with_default_options() {
        let control = tick::ClockControl::new();
        let mock = MockMemoryCache::new(control.to_clock());
        let cache = CoalescingMemoryCache::from_shared(Arc::new(mock.clone()), false)
            .with_default_options(EntryOptions::new().with_time_to_live(Duration::from_secs(10)));

        let value = cache.get_or_create("k", || async { Ok::<_, BoxError>(1_u8) }).await;
        assert_eq!(value.ok(), Some(1));

        control.advance(Duration::from_secs(10));
        assert_eq!(mock.get::<u8>(&"k"), None);
    }

    #[tokio::test]
    async fn leader_is_reported() {
        let mock = MockMemoryCache::new(Clock::new_frozen());
        let cache = CoalescingMemoryCache::new(mock);
        let cancel = CancellationToken::new();

        let first = cache
            .get_or_create_with_cancel("k", || async { Ok::<_, BoxError>(1_u8) }, &cancel)
            .await;
        let second = cache
            .get_or_create_with_cancel("k", || async { Ok::<_, BoxError>(2_u8) }, &cancel)
            .await;

        assert_eq!(first.ok(), Some(Coalesced { value: 1, leader: true }));
        assert_eq!(second.ok(), Some(Coalesced { value: 1, leader: false }));
    }

    #[tokio::test]
    async fn passthrough_forwards_to_inner() {
        let mock = MockMemoryCache::new(Clock::new_frozen());
        let cache = CoalescingMemoryCache::from_shared(Arc::new(mock.clone()), false);

        cache.insert("a", 1_u8, EntryOptions::new());
        let mut entry = cache.create_entry("b");
        entry.set_value(2_u8);
        entry.commit();
        cache.remove(&"a");

        assert_eq!(mock.get::<u8>(&"b"), Some(2));
        assert_eq!(
            mock.operations(),
            vec![CacheOp::Set("a"), CacheOp::Set("b"), CacheOp::Remove("a"), CacheOp::TryGet("b")]
        );
    }
}
