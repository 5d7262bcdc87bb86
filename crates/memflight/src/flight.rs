// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared, awaitable handles to one in-flight value computation.

use std::{
    fmt::Debug,
    hash::Hash,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared, WeakShared},
};
use memflight_tier::{CacheValue, downcast_ref, erase};
use tokio_util::sync::CancellationToken;

use crate::{BoxError, Error, Result};

/// A handle to a single execution of a value factory.
///
/// Every clone observes the same execution and the same outcome, success or
/// failure. The computation starts when the handle is first awaited, and a
/// completed handle yields its outcome without suspending.
///
/// `SingleFlightLazyCache` stores these handles in the cache itself, so they can
/// show up in eviction callbacks.
pub struct Flight<T> {
    inner: Shared<BoxFuture<'static, Result<T>>>,
    detached: bool,
}

impl<T> Clone for Flight<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            detached: self.detached,
        }
    }
}

impl<T> Debug for Flight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flight")
            .field("complete", &self.inner.peek().is_some())
            .finish()
    }
}

impl<T> Flight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Runs `body` on its own Tokio task once the handle is first polled.
    ///
    /// The task keeps running when every waiter goes away, and a panic inside it
    /// surfaces as [`Error::FactoryPanicked`].
    pub(crate) fn spawned<B>(body: B) -> Self
    where
        B: Future<Output = Result<T>> + Send + 'static,
    {
        let task = async move {
            match tokio::spawn(body).await {
                Ok(outcome) => outcome,
                Err(error) if error.is_panic() => Err(Error::FactoryPanicked),
                Err(_) => Err(Error::Cancelled),
            }
        };

        Self {
            inner: task.boxed().shared(),
            detached: true,
        }
    }

    /// Runs `body` on whichever waiter polls the handle.
    ///
    /// A body that completes on its first poll never suspends a waiter. The body
    /// only makes progress while somebody awaits the handle, and is dropped with
    /// the last handle.
    pub(crate) fn inline<B>(body: B) -> Self
    where
        B: Future<Output = Result<T>> + Send + 'static,
    {
        let task = AssertUnwindSafe(body)
            .catch_unwind()
            .map(|outcome| outcome.unwrap_or_else(|_| Err(Error::FactoryPanicked)));

        Self {
            inner: task.boxed().shared(),
            detached: false,
        }
    }

    /// The outcome, if the computation already finished.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T>> {
        self.inner.peek().cloned()
    }

    /// Returns `true` once the computation finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.peek().is_some()
    }

    /// Waits for the outcome.
    ///
    /// Cancelling `cancel` abandons only this wait; the computation goes on for
    /// everybody else.
    ///
    /// # Errors
    ///
    /// Returns the shared outcome of the computation, or [`Error::Cancelled`].
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<T> {
        if let Some(outcome) = self.peek() {
            return outcome;
        }

        // The handle is polled first so that its work is started even by a waiter
        // that is cancelled right away.
        tokio::select! {
            biased;
            outcome = self.inner.clone() => outcome,
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

/// Turns a user factory into a body yielding crate errors.
pub(crate) async fn run_factory<T, F, Fut, E>(factory: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
{
    factory().await.map_err(Error::factory)
}

struct Registered {
    id: u64,
    flight: CacheValue,
}

impl Registered {
    fn new<T>(id: u64, flight: &Flight<T>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self {
            id,
            flight: erase(Registration::of(flight)),
        }
    }
}

/// How the registry holds a flight.
///
/// A spawned flight runs to completion on its own, so the registry keeps it
/// alive for later joiners. An inline flight only runs while awaited, so the
/// registry must not be what keeps it alive.
enum Registration<T> {
    Detached(Flight<T>),
    Polled(WeakShared<BoxFuture<'static, Result<T>>>),
}

impl<T> Registration<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn of(flight: &Flight<T>) -> Self {
        if !flight.detached
            && let Some(weak) = flight.inner.downgrade()
        {
            return Self::Polled(weak);
        }
        Self::Detached(flight.clone())
    }

    /// The registered flight, unless every handle to it was dropped.
    fn upgrade(&self) -> Option<Flight<T>> {
        match self {
            Self::Detached(flight) => Some(flight.clone()),
            Self::Polled(weak) => weak.upgrade().map(|inner| Flight { inner, detached: false }),
        }
    }
}

/// How a caller relates to the flight registered for its key.
pub(crate) enum Joined<T> {
    /// The caller registered a new flight.
    Leader(Flight<T>),
    /// The caller joined a flight registered by somebody else.
    Follower(Flight<T>),
    /// A flight for another value type is registered; the caller got its own,
    /// unregistered one.
    Uncoalesced(Flight<T>),
}

/// A registry of flights in progress, at most one per key.
///
/// Entries are added by [`join_or_start`](Self::join_or_start) and removed by
/// [`finish`](Self::finish) with the id they were registered under, so a late
/// removal never drops a newer flight for the same key.
pub(crate) struct InFlight<K> {
    flights: DashMap<K, Registered>,
    next_id: AtomicU64,
}

impl<K> Debug for InFlight<K>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight").field("len", &self.flights.len()).finish()
    }
}

impl<K> InFlight<K>
where
    K: Clone + Eq + Hash,
{
    pub(crate) fn new() -> Self {
        Self {
            flights: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Joins the flight registered for `key`, or registers the one built by `start`.
    ///
    /// `start` receives the id to pass to [`finish`](Self::finish) once the flight
    /// is done. It runs under the registry's shard lock and must not block.
    pub(crate) fn join_or_start<T, S>(&self, key: &K, start: S) -> Joined<T>
    where
        T: Clone + Send + Sync + 'static,
        S: FnOnce(u64) -> Flight<T>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match self.flights.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let registered = downcast_ref::<Registration<T>>(&occupied.get().flight).map(Registration::upgrade);
                match registered {
                    Some(Some(flight)) => Joined::Follower(flight),
                    // Abandoned; its late `finish` carries the old id and leaves this entry alone.
                    Some(None) => {
                        let flight = start(id);
                        occupied.insert(Registered::new(id, &flight));
                        Joined::Leader(flight)
                    }
                    None => {
                        drop(occupied);
                        Joined::Uncoalesced(start(id))
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let flight = start(id);
                vacant.insert(Registered::new(id, &flight));
                Joined::Leader(flight)
            }
        }
    }

    /// Removes the flight registered for `key` under `id`, if it is still there.
    pub(crate) fn finish(&self, key: &K, id: u64) {
        self.flights.remove_if(key, |_, registered| registered.id == id);
    }

    pub(crate) fn len(&self) -> usize {
        self.flights.len()
    }
}

/// Removes a flight from its registry when dropped, on every exit path of the body.
pub(crate) struct Deregister<K>
where
    K: Clone + Eq + Hash,
{
    registry: Arc<InFlight<K>>,
    key: K,
    id: u64,
}

impl<K> Deregister<K>
where
    K: Clone + Eq + Hash,
{
    pub(crate) fn new(registry: Arc<InFlight<K>>, key: K, id: u64) -> Self {
        Self { registry, key, id }
    }
}

impl<K> Drop for Deregister<K>
where
    K: Clone + Eq + Hash,
{
    fn drop(&mut self) {
        self.registry.finish(&self.key, self.id);
    }
}
