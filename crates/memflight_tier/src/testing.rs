// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock cache implementation for testing.
//!
//! This module provides [`MockMemoryCache`], a small clock-driven cache that records
//! every operation, so tests can assert both the values served and the way a
//! decorator talked to its collaborator.

use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc};

use parking_lot::Mutex;
use tick::Clock;

use crate::{
    CacheValue, EntryOptions, EvictionCallback, EvictionListeners, EvictionReason, EvictionSubscription, Expiration, MemoryCache,
};

/// Recorded cache operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp<K> {
    /// A `try_get` was performed for the key.
    TryGet(K),
    /// A `set` was performed for the key.
    Set(K),
    /// A `remove` was performed for the key.
    Remove(K),
    /// A `get_or_insert_with` was performed for the key.
    GetOrInsert(K),
    /// A `clear` was performed.
    Clear,
}

struct Slot<K> {
    value: CacheValue,
    expiration: Expiration,
    callbacks: Vec<EvictionCallback<K>>,
}

type Evicted<K> = Vec<(K, Slot<K>, EvictionReason)>;

/// An in-memory [`MemoryCache`] for tests.
///
/// Expiration is evaluated lazily against the supplied [`Clock`] whenever a key is
/// accessed, so a frozen clock or a `ClockControl` makes expiry deterministic.
/// Eviction callbacks fire on the calling thread after the internal lock is
/// released. Clones share the same state.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use memflight_tier::{EntryOptions, MemoryCache, testing::{CacheOp, MockMemoryCache}};
/// use tick::ClockControl;
///
/// let control = ClockControl::new();
/// let cache = MockMemoryCache::new(control.to_clock());
///
/// cache.insert("key", 42_i32, EntryOptions::new().with_time_to_live(Duration::from_secs(5)));
/// assert_eq!(cache.get::<i32>(&"key"), Some(42));
///
/// control.advance(Duration::from_secs(5));
/// assert_eq!(cache.get::<i32>(&"key"), None);
///
/// assert_eq!(
///     cache.operations(),
///     vec![CacheOp::Set("key"), CacheOp::TryGet("key"), CacheOp::TryGet("key")]
/// );
/// ```
pub struct MockMemoryCache<K> {
    clock: Clock,
    data: Arc<Mutex<HashMap<K, Slot<K>>>>,
    operations: Arc<Mutex<Vec<CacheOp<K>>>>,
    listeners: EvictionListeners<K>,
}

impl<K: Debug> Debug for MockMemoryCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMemoryCache")
            .field("entries", &self.data.lock().len())
            .field("operations", &self.operations)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl<K> Clone for MockMemoryCache<K> {
    fn clone(&self) -> Self {
        Self {
            clock: self.clock.clone(),
            data: Arc::clone(&self.data),
            operations: Arc::clone(&self.operations),
            listeners: self.listeners.clone(),
        }
    }
}

impl<K> MockMemoryCache<K> {
    /// Creates an empty mock cache evaluating expiration on `clock`.
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            data: Arc::new(Mutex::new(HashMap::new())),
            operations: Arc::new(Mutex::new(Vec::new())),
            listeners: EvictionListeners::new(),
        }
    }

    /// The clock the cache evaluates expiration on.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

impl<K: Clone> MockMemoryCache<K> {
    /// Returns a clone of all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<CacheOp<K>> {
        self.operations.lock().clone()
    }

    /// Clears all recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().clear();
    }

    fn record(&self, op: CacheOp<K>) {
        self.operations.lock().push(op);
    }

    fn notify(&self, evicted: Evicted<K>) {
        for (key, slot, reason) in evicted {
            for callback in &slot.callbacks {
                callback(&key, &slot.value, reason);
            }
            self.listeners.notify(&key, &slot.value, reason);
        }
    }
}

impl<K: Clone + Eq + Hash> MockMemoryCache<K> {
    /// Returns the number of stored entries, including expired ones not yet observed.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.data.lock().len()
    }

    /// Returns `true` if a live entry is stored for `key`. Not recorded.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        let now = self.clock.instant();
        self.data.lock().get(key).is_some_and(|slot| !slot.expiration.is_expired(now))
    }

    // Drops the slot for `key` when it expired, so callers see a plain miss.
    fn purge_expired(&self, data: &mut HashMap<K, Slot<K>>, key: &K, evicted: &mut Evicted<K>) {
        let now = self.clock.instant();
        if data.get(key).is_some_and(|slot| slot.expiration.is_expired(now))
            && let Some(slot) = data.remove(key)
        {
            evicted.push((key.clone(), slot, EvictionReason::Expired));
        }
    }

    fn store(&self, data: &mut HashMap<K, Slot<K>>, key: K, value: CacheValue, options: EntryOptions<K>, evicted: &mut Evicted<K>) {
        let slot = Slot {
            value,
            expiration: Expiration::new(&options, self.clock.instant()),
            callbacks: options.into_post_eviction_callbacks(),
        };

        if let Some(previous) = data.insert(key.clone(), slot) {
            evicted.push((key, previous, EvictionReason::Replaced));
        }
    }
}

impl<K> MemoryCache<K> for MockMemoryCache<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn try_get(&self, key: &K) -> Option<CacheValue> {
        self.record(CacheOp::TryGet(key.clone()));

        let mut evicted = Vec::new();
        let value = {
            let mut data = self.data.lock();
            self.purge_expired(&mut data, key, &mut evicted);
            data.get(key).map(|slot| {
                slot.expiration.touch(self.clock.instant());
                Arc::clone(&slot.value)
            })
        };

        self.notify(evicted);
        value
    }

    fn set(&self, key: K, value: CacheValue, options: EntryOptions<K>) {
        self.record(CacheOp::Set(key.clone()));

        let mut evicted = Vec::new();
        self.store(&mut self.data.lock(), key, value, options, &mut evicted);
        self.notify(evicted);
    }

    fn remove(&self, key: &K) {
        self.record(CacheOp::Remove(key.clone()));

        let removed = self.data.lock().remove(key);
        if let Some(slot) = removed {
            self.notify(vec![(key.clone(), slot, EvictionReason::Removed)]);
        }
    }

    fn subscribe_evictions(&self, callback: EvictionCallback<K>) -> EvictionSubscription {
        self.listeners.subscribe(callback)
    }

    fn clear(&self) {
        self.record(CacheOp::Clear);

        let drained: Vec<_> = self.data.lock().drain().collect();
        self.notify(
            drained
                .into_iter()
                .map(|(key, slot)| (key, slot, EvictionReason::Cleared))
                .collect(),
        );
    }

    fn get_or_insert_with(
        &self,
        key: K,
        accept: &mut dyn FnMut(&CacheValue) -> bool,
        init: &mut dyn FnMut() -> (CacheValue, EntryOptions<K>),
    ) -> CacheValue {
        self.record(CacheOp::GetOrInsert(key.clone()));

        let mut evicted = Vec::new();
        let value = {
            let mut data = self.data.lock();
            self.purge_expired(&mut data, &key, &mut evicted);

            let existing = data.get(&key).filter(|slot| accept(&slot.value)).map(|slot| {
                slot.expiration.touch(self.clock.instant());
                Arc::clone(&slot.value)
            });

            if let Some(value) = existing {
                value
            } else {
                let (value, options) = init();
                self.store(&mut data, key, Arc::clone(&value), options, &mut evicted);
                value
            }
        };

        self.notify(evicted);
        value
    }

    fn len(&self) -> Option<u64> {
        u64::try_from(self.data.lock().len()).ok()
    }
}
