// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lock-based single-flight population.

use std::{fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use dashmap::DashMap;
use memflight_tier::{EntryOptions, MemoryCache};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::{
    BoxError, Error, Result,
    telemetry::{CacheActivity, Component, emit},
};

type Gate = Arc<AsyncMutex<()>>;

/// Populates a cache through a per-key gate, so one caller at a time runs the
/// factory for a key.
///
/// A caller that finds the value already cached returns it without touching the
/// gates. Otherwise it queues on the key's gate, checks the cache again once
/// through, and only then runs its factory.
///
/// A factory failure is reported to the caller that ran the factory and to
/// nobody else: the next caller through the gate finds the cache still empty and
/// runs its own factory. Calls for one key never overlap, but a key can see one
/// factory run per failed attempt.
///
/// Gates exist only while somebody holds or waits for them, so
/// [`in_flight`](Self::in_flight) is bounded by the number of keys currently
/// being populated.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use memflight::{CancellationToken, InMemoryCache, SingleFlightCache};
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> memflight::Result<()> {
/// let cache = SingleFlightCache::new(InMemoryCache::new(Clock::new_frozen()));
/// let cancel = CancellationToken::new();
///
/// let name = cache
///     .get_or_create("user:42".to_string(), Duration::from_secs(300), || async {
///         Ok::<_, std::io::Error>("Ferris".to_string())
///     }, &cancel)
///     .await?;
///
/// assert_eq!(name, "Ferris");
/// assert_eq!(cache.in_flight(), 0);
/// # Ok(())
/// # }
/// ```
pub struct SingleFlightCache<K, C> {
    cache: C,
    gates: DashMap<K, Gate>,
}

impl<K, C> Debug for SingleFlightCache<K, C>
where
    K: Eq + Hash,
    C: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("cache", &self.cache)
            .field("in_flight", &self.gates.len())
            .finish()
    }
}

impl<K, C> SingleFlightCache<K, C>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    C: MemoryCache<K>,
{
    /// Wraps `cache`.
    #[must_use]
    pub fn new(cache: C) -> Self {
        Self {
            cache,
            gates: DashMap::new(),
        }
    }

    /// The decorated cache.
    #[must_use]
    pub fn inner(&self) -> &C {
        &self.cache
    }

    /// The number of keys with a live gate.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.gates.len()
    }

    /// Returns the cached `T` for `key`, or runs `factory` and caches its value for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when `cancel` fires before a value is available,
    /// and [`Error::Factory`] when this caller's own factory fails.
    pub async fn get_or_create<T, F, Fut, E>(&self, key: K, ttl: Duration, factory: F, cancel: &CancellationToken) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        self.get_or_create_configured(key, ttl, |_| {}, factory, cancel).await
    }

    /// Like [`get_or_create`](Self::get_or_create), with `configure` applied to the
    /// entry options after the time-to-live and before the value is committed.
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
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(value) = self.cache.get::<T>(&key) {
            emit(Component::SingleFlight, CacheActivity::Hit, &key);
            return Ok(value);
        }

        emit(Component::SingleFlight, CacheActivity::Miss, &key);
        let lease = GateLease::acquire(&self.gates, key);

        let _permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            permit = lease.gate().lock() => permit,
        };
        emit(Component::SingleFlight, CacheActivity::GateAcquired, lease.key());

        if let Some(value) = self.cache.get::<T>(lease.key()) {
            emit(Component::SingleFlight, CacheActivity::Joined, lease.key());
            return Ok(value);
        }

        let value = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = factory() => outcome.map_err(Error::factory)?,
        };

        let mut entry = self.cache.create_entry(lease.key().clone());
        entry.set_time_to_live(ttl);
        configure(entry.options_mut());
        entry.set_value(value.clone());
        entry.commit();

        emit(Component::SingleFlight, CacheActivity::Populated, lease.key());
        Ok(value)
    }
}

/// A share of the gate for one key. The last lease to go removes the gate.
struct GateLease<'a, K>
where
    K: Eq + Hash,
{
    gates: &'a DashMap<K, Gate>,
    key: K,
    gate: Gate,
}

impl<'a, K> GateLease<'a, K>
where
    K: Clone + Eq + Hash,
{
    fn acquire(gates: &'a DashMap<K, Gate>, key: K) -> Self {
        let gate = Arc::clone(gates.entry(key.clone()).or_default().value());
        Self {
            gates,
            key,
            gate,
        }
    }

    fn key(&self) -> &K {
        &self.key
    }

    fn gate(&self) -> &AsyncMutex<()> {
        &self.gate
    }
}

impl<K> Drop for GateLease<'_, K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        // Leases are handed out under the shard lock, so a count of two (the map
        // and this lease) means no other caller holds or waits for this gate.
        self.gates.remove_if(&self.key, |_, gate| Arc::strong_count(gate) == 2);
    }
}
