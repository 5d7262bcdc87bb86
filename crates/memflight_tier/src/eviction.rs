// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Eviction notifications.
//!
//! Callbacks can be attached to a single entry through
//! [`EntryOptions::with_post_eviction_callback`](crate::EntryOptions::with_post_eviction_callback)
//! or to a whole cache through [`MemoryCache::subscribe_evictions`](crate::MemoryCache::subscribe_evictions).
//! Implementations may invoke them from any thread, at any time after the entry left
//! the cache.

use std::{
    fmt::Debug,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::CacheValue;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EvictionReason {
    /// The entry was removed explicitly.
    Removed,
    /// The entry was overwritten by a newer value for the same key.
    Replaced,
    /// The entry outlived its expiration.
    Expired,
    /// The entry was evicted to stay within capacity.
    Capacity,
    /// The whole cache was cleared.
    Cleared,
}

impl EvictionReason {
    /// Returns a stable lowercase name, suitable for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Removed => "removed",
            Self::Replaced => "replaced",
            Self::Expired => "expired",
            Self::Capacity => "capacity",
            Self::Cleared => "cleared",
        }
    }
}

/// A callback invoked with the key, the evicted value and the reason.
pub type EvictionCallback<K> = Arc<dyn Fn(&K, &CacheValue, EvictionReason) + Send + Sync>;

struct Listeners<K> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, EvictionCallback<K>)>>,
}

/// A registry of cache-wide eviction observers.
///
/// Cloning yields a handle to the same registry.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
///
/// use memflight_tier::{CacheValue, EvictionListeners, EvictionReason, erase};
///
/// let listeners = EvictionListeners::<String>::new();
/// let seen = Arc::new(AtomicUsize::new(0));
///
/// let counter = Arc::clone(&seen);
/// let subscription = listeners.subscribe(Arc::new(move |_key: &String, _value: &CacheValue, _reason: EvictionReason| {
///     counter.fetch_add(1, Ordering::Relaxed);
/// }));
///
/// listeners.notify(&"a".to_string(), &erase(1), EvictionReason::Removed);
/// drop(subscription);
/// listeners.notify(&"b".to_string(), &erase(2), EvictionReason::Removed);
///
/// assert_eq!(seen.load(Ordering::Relaxed), 1);
/// ```
pub struct EvictionListeners<K> {
    inner: Arc<Listeners<K>>,
}

impl<K> Debug for EvictionListeners<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionListeners").field("len", &self.len()).finish()
    }
}

impl<K> Clone for EvictionListeners<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for EvictionListeners<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> EvictionListeners<K> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Listeners {
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.callbacks.lock().len()
    }

    /// Returns `true` if nobody is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every subscribed callback.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe themselves.
    pub fn notify(&self, key: &K, value: &CacheValue, reason: EvictionReason) {
        let snapshot: Vec<_> = self
            .inner
            .callbacks
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            callback(key, value, reason);
        }
    }
}

impl<K: 'static> EvictionListeners<K> {
    /// Registers a callback until the returned subscription is dropped.
    pub fn subscribe(&self, callback: EvictionCallback<K>) -> EvictionSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.lock().push((id, callback));

        let registry: Weak<Listeners<K>> = Arc::downgrade(&self.inner);
        EvictionSubscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.callbacks.lock().retain(|(other, _)| *other != id);
                }
            })),
        }
    }
}

/// Keeps an eviction callback registered.
///
/// Dropping the subscription unregisters the callback. Use [`detach`](Self::detach)
/// to keep it registered for the lifetime of the cache.
#[must_use = "dropping the subscription unregisters the callback immediately"]
pub struct EvictionSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl EvictionSubscription {
    /// A subscription that is not attached to anything.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Unregisters the callback.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Leaves the callback registered for as long as the cache lives.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Debug for EvictionSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for EvictionSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
