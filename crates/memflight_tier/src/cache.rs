// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{any::Any, sync::Arc};

use crate::{CacheEntry, CacheValue, EntryOptions, EvictionCallback, EvictionSubscription, downcast_ref, erase};

/// A process-local key/value store with type-erased values.
///
/// Implementations own storage, expiration and eviction. All operations take
/// `&self` and are safe to call concurrently; individual operations are atomic
/// per key, but nothing spans more than one call unless documented.
///
/// Values are stored as [`CacheValue`]. Reading a value back as a type other than
/// the one it was stored with is a miss, not an error.
pub trait MemoryCache<K>: Send + Sync {
    /// Returns the live value stored for `key`.
    fn try_get(&self, key: &K) -> Option<CacheValue>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: K, value: CacheValue, options: EntryOptions<K>);

    /// Removes the value stored for `key`, if any.
    fn remove(&self, key: &K);

    /// Registers an observer for every entry leaving the cache.
    ///
    /// Callbacks may run on any thread and at any time after the eviction.
    fn subscribe_evictions(&self, callback: EvictionCallback<K>) -> EvictionSubscription;

    /// Removes every entry.
    fn clear(&self);

    /// Starts a scoped entry for `key`, committed into this cache when dropped.
    fn create_entry(&self, key: K) -> CacheEntry<'_, K> {
        CacheEntry::new(key, move |key, value, options| self.set(key, value, options))
    }

    /// Returns the value for `key` if `accept` approves it, otherwise stores the
    /// result of `init` and returns that.
    ///
    /// `init` is called at most once. The default implementation reads, then writes,
    /// so two racing callers may both run `init`. Implementations that can hold a
    /// per-key lock across both steps should override it; callers that need
    /// exactly-once population depend on that.
    fn get_or_insert_with(
        &self,
        key: K,
        accept: &mut dyn FnMut(&CacheValue) -> bool,
        init: &mut dyn FnMut() -> (CacheValue, EntryOptions<K>),
    ) -> CacheValue {
        if let Some(value) = self.try_get(&key).filter(|value| accept(value)) {
            return value;
        }

        let (value, options) = init();
        self.set(key, Arc::clone(&value), options);
        value
    }

    /// The number of stored entries, when the implementation tracks it.
    fn len(&self) -> Option<u64> {
        None
    }

    /// Returns a copy of the value for `key` if it is stored as a `T`.
    fn get<T: Any + Clone>(&self, key: &K) -> Option<T>
    where
        Self: Sized,
    {
        self.try_get(key).and_then(|value| downcast_ref::<T>(&value).cloned())
    }

    /// Stores a typed value.
    fn insert<T: Any + Send + Sync>(&self, key: K, value: T, options: EntryOptions<K>)
    where
        Self: Sized,
    {
        self.set(key, erase(value), options);
    }
}

impl<K, C: MemoryCache<K> + ?Sized> MemoryCache<K> for Arc<C> {
    fn try_get(&self, key: &K) -> Option<CacheValue> {
        (**self).try_get(key)
    }

    fn set(&self, key: K, value: CacheValue, options: EntryOptions<K>) {
        (**self).set(key, value, options);
    }

    fn remove(&self, key: &K) {
        (**self).remove(key);
    }

    fn subscribe_evictions(&self, callback: EvictionCallback<K>) -> EvictionSubscription {
        (**self).subscribe_evictions(callback)
    }

    fn clear(&self) {
        (**self).clear();
    }

    fn create_entry(&self, key: K) -> CacheEntry<'_, K> {
        (**self).create_entry(key)
    }

    fn get_or_insert_with(
        &self,
        key: K,
        accept: &mut dyn FnMut(&CacheValue) -> bool,
        init: &mut dyn FnMut() -> (CacheValue, EntryOptions<K>),
    ) -> CacheValue {
        (**self).get_or_insert_with(key, accept, init)
    }

    fn len(&self) -> Option<u64> {
        (**self).len()
    }
}

impl<K, C: MemoryCache<K> + ?Sized> MemoryCache<K> for &C {
    fn try_get(&self, key: &K) -> Option<CacheValue> {
        (**self).try_get(key)
    }

    fn set(&self, key: K, value: CacheValue, options: EntryOptions<K>) {
        (**self).set(key, value, options);
    }

    fn remove(&self, key: &K) {
        (**self).remove(key);
    }

    fn subscribe_evictions(&self, callback: EvictionCallback<K>) -> EvictionSubscription {
        (**self).subscribe_evictions(callback)
    }

    fn clear(&self) {
        (**self).clear();
    }

    fn create_entry(&self, key: K) -> CacheEntry<'_, K> {
        (**self).create_entry(key)
    }

    fn get_or_insert_with(
        &self,
        key: K,
        accept: &mut dyn FnMut(&CacheValue) -> bool,
        init: &mut dyn FnMut() -> (CacheValue, EntryOptions<K>),
    ) -> CacheValue {
        (**self).get_or_insert_with(key, accept, init)
    }

    fn len(&self) -> Option<u64> {
        (**self).len()
    }
}
