// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for configuring in-memory caches.
//!
//! This module keeps the moka configuration behind a small builder, so moka types
//! never appear in the public API.

use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;

use tick::Clock;

use crate::cache::InMemoryCache;

/// Builder for configuring an [`InMemoryCache`].
///
/// Expiration is configured per entry through `EntryOptions`; the builder only
/// covers the store itself. The clock is mandatory: it is the time source every
/// expiration decision is made against.
///
/// # Examples
///
/// ```
/// use memflight_memory::InMemoryCache;
/// use tick::Clock;
///
/// # let clock = Clock::new_frozen();
/// let cache = InMemoryCache::<String>::builder(clock)
///     .max_capacity(1000)
///     .initial_capacity(100)
///     .name("my-cache")
///     .build();
/// ```
pub struct InMemoryCacheBuilder<K> {
    pub(crate) clock: Clock,
    pub(crate) max_capacity: Option<u64>,
    pub(crate) initial_capacity: Option<usize>,
    pub(crate) name: Option<String>,
    _phantom: PhantomData<K>,
}

impl<K> Debug for InMemoryCacheBuilder<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCacheBuilder")
            .field("max_capacity", &self.max_capacity)
            .field("initial_capacity", &self.initial_capacity)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K> InMemoryCacheBuilder<K> {
    /// Creates a builder for an unbounded cache that evaluates expiration on `clock`.
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            max_capacity: None,
            initial_capacity: None,
            name: None,
            _phantom: PhantomData,
        }
    }

    /// Sets the maximum number of entries.
    ///
    /// Once the capacity is reached, entries are evicted with moka's `TinyLFU` policy
    /// and reported with `EvictionReason::Capacity`.
    ///
    /// If not set, the cache is unbounded.
    #[must_use]
    pub fn max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = Some(capacity);
        self
    }

    /// Sets the initial capacity (pre-allocation hint) for the cache.
    #[must_use]
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = Some(capacity);
        self
    }

    /// Sets a name for the cache, used in logs and debugging output.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builds the configured [`InMemoryCache`].
    #[must_use]
    pub fn build(self) -> InMemoryCache<K>
    where
        K: Hash + Eq + Send + Sync + 'static,
    {
        InMemoryCache::from_builder(self)
    }
}
