// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory cache implementation using moka.
//!
//! Every entry is stored as a [`Slot`] holding the erased value, its expiration state
//! and its post-eviction callbacks. Moka removes expired slots physically through the
//! [`SlotExpiry`] policy, while every read also checks the slot against the injected
//! clock, so an entry is never served past its deadline even before moka catches up.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memflight_tier::{
    CacheValue, EntryOptions, EvictionCallback, EvictionListeners, EvictionReason, EvictionSubscription, Expiration, MemoryCache,
};
use moka::notification::RemovalCause;
use moka::ops::compute::Op;
use moka::sync::Cache;
use parking_lot::Mutex;
use tick::Clock;

use crate::builder::InMemoryCacheBuilder;

struct Slot<K> {
    value: CacheValue,
    expiration: Expiration,
    callbacks: Vec<EvictionCallback<K>>,
    // Set right before an explicit removal that stands for another reason.
    reason: Mutex<Option<EvictionReason>>,
}

impl<K> Slot<K> {
    fn new(value: CacheValue, options: EntryOptions<K>, now: Instant) -> Self {
        Self {
            value,
            expiration: Expiration::new(&options, now),
            callbacks: options.into_post_eviction_callbacks(),
            reason: Mutex::new(None),
        }
    }

    fn mark(&self, reason: EvictionReason) {
        *self.reason.lock() = Some(reason);
    }

    fn reason(&self, cause: RemovalCause) -> EvictionReason {
        match cause {
            RemovalCause::Explicit => self.reason.lock().take().unwrap_or(EvictionReason::Removed),
            RemovalCause::Replaced => self.reason.lock().take().unwrap_or(EvictionReason::Replaced),
            RemovalCause::Expired => EvictionReason::Expired,
            RemovalCause::Size => EvictionReason::Capacity,
        }
    }
}

/// Tells moka when to drop a slot, measured on the cache clock.
struct SlotExpiry {
    clock: Clock,
}

impl<K> moka::Expiry<K, Arc<Slot<K>>> for SlotExpiry {
    fn expire_after_create(&self, _key: &K, value: &Arc<Slot<K>>, _created_at: Instant) -> Option<Duration> {
        value.expiration.time_to_live(self.clock.instant())
    }

    fn expire_after_read(
        &self,
        _key: &K,
        value: &Arc<Slot<K>>,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        let now = self.clock.instant();

        // An expired slot stays visible so `try_get` can remove it as expired.
        if value.expiration.is_expired(now) {
            return duration_until_expiry;
        }

        value.expiration.time_to_live_after_touch(now)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &Arc<Slot<K>>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.expiration.time_to_live(self.clock.instant())
    }
}

/// A process-local memory cache backed by moka.
///
/// This cache provides:
/// - Concurrent access with high performance
/// - Capacity-based eviction
/// - Absolute, relative and sliding expiration per entry
/// - Atomic per-key [`get_or_insert_with`](MemoryCache::get_or_insert_with)
///
/// Clones share the same storage.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use memflight_memory::InMemoryCache;
/// use memflight_tier::{EntryOptions, MemoryCache};
/// use tick::ClockControl;
///
/// let control = ClockControl::new();
/// let cache = InMemoryCache::<String>::new(control.to_clock());
///
/// let options = EntryOptions::new().with_time_to_live(Duration::from_secs(5));
/// cache.insert("key".to_string(), 42_i32, options);
/// assert_eq!(cache.get::<i32>(&"key".to_string()), Some(42));
///
/// control.advance(Duration::from_secs(5));
/// assert_eq!(cache.get::<i32>(&"key".to_string()), None);
/// ```
pub struct InMemoryCache<K> {
    inner: Cache<K, Arc<Slot<K>>>,
    clock: Clock,
    listeners: EvictionListeners<K>,
}

impl<K> Clone for InMemoryCache<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            clock: self.clock.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<K> Debug for InMemoryCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("name", &self.inner.name())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl<K> InMemoryCache<K>
where
    K: Hash + Eq + Send + Sync + 'static,
{
    /// Creates an unbounded cache that evaluates expiration on `clock`.
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self::builder(clock).build()
    }

    /// Creates a cache holding at most `max_capacity` entries.
    #[must_use]
    pub fn with_capacity(clock: Clock, max_capacity: u64) -> Self {
        Self::builder(clock).max_capacity(max_capacity).build()
    }

    /// Creates a new builder for configuring an in-memory cache.
    #[must_use]
    pub fn builder(clock: Clock) -> InMemoryCacheBuilder<K> {
        InMemoryCacheBuilder::new(clock)
    }

    pub(crate) fn from_builder(builder: InMemoryCacheBuilder<K>) -> Self {
        let listeners = EvictionListeners::new();
        let notify = listeners.clone();

        let mut moka_builder = Cache::<K, Arc<Slot<K>>>::builder()
            .expire_after(SlotExpiry {
                clock: builder.clock.clone(),
            })
            .eviction_listener(move |key: Arc<K>, slot: Arc<Slot<K>>, cause| {
                let reason = slot.reason(cause);
                for callback in &slot.callbacks {
                    callback(&*key, &slot.value, reason);
                }
                notify.notify(&*key, &slot.value, reason);
            });

        if let Some(capacity) = builder.max_capacity {
            moka_builder = moka_builder.max_capacity(capacity);
        }

        if let Some(capacity) = builder.initial_capacity {
            moka_builder = moka_builder.initial_capacity(capacity);
        }

        if let Some(name) = builder.name.as_deref() {
            moka_builder = moka_builder.name(name);
        }

        Self {
            inner: moka_builder.build(),
            clock: builder.clock,
            listeners,
        }
    }

    /// Runs moka's pending maintenance, delivering any queued eviction notifications.
    pub fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks();
    }

    /// The clock expiration is evaluated on.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

impl<K> InMemoryCache<K>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
{
    // Removes `slot` if it is still the one stored for `key`.
    fn expire(&self, key: &K, slot: &Arc<Slot<K>>) {
        let _ = self.inner.entry(key.clone()).and_compute_with(|current| match current {
            Some(entry) if Arc::ptr_eq(entry.value(), slot) => {
                slot.mark(EvictionReason::Expired);
                Op::Remove
            }
            _ => Op::Nop,
        });
    }
}

impl<K> MemoryCache<K> for InMemoryCache<K>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
{
    fn try_get(&self, key: &K) -> Option<CacheValue> {
        let slot = self.inner.get(key)?;
        let now = self.clock.instant();

        if slot.expiration.is_expired(now) {
            self.expire(key, &slot);
            return None;
        }

        slot.expiration.touch(now);
        Some(Arc::clone(&slot.value))
    }

    fn set(&self, key: K, value: CacheValue, options: EntryOptions<K>) {
        let slot = Slot::new(value, options, self.clock.instant());
        self.inner.insert(key, Arc::new(slot));
    }

    fn remove(&self, key: &K) {
        self.inner.invalidate(key);
    }

    fn subscribe_evictions(&self, callback: EvictionCallback<K>) -> EvictionSubscription {
        self.listeners.subscribe(callback)
    }

    fn clear(&self) {
        for (_, slot) in self.inner.iter() {
            slot.mark(EvictionReason::Cleared);
        }
        self.inner.invalidate_all();
    }

    fn get_or_insert_with(
        &self,
        key: K,
        accept: &mut dyn FnMut(&CacheValue) -> bool,
        init: &mut dyn FnMut() -> (CacheValue, EntryOptions<K>),
    ) -> CacheValue {
        let now = self.clock.instant();

        let entry = self.inner.entry(key).or_insert_with_if(
            || {
                let (value, options) = init();
                Arc::new(Slot::new(value, options, now))
            },
            |slot| {
                if slot.expiration.is_expired(now) {
                    slot.mark(EvictionReason::Expired);
                    return true;
                }
                !accept(&slot.value)
            },
        );

        let slot = entry.into_value();
        slot.expiration.touch(now);
        Arc::clone(&slot.value)
    }

    fn len(&self) -> Option<u64> {
        Some(self.inner.entry_count())
    }
}
