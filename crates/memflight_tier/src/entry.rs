// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{any::Any, fmt::Debug, time::Duration, time::Instant};

use crate::{CacheValue, EntryOptions, EvictionCallback, erase};

type Sink<'a, K> = Box<dyn FnOnce(K, CacheValue, EntryOptions<K>) + Send + 'a>;

/// An entry being prepared for a cache.
///
/// Created by [`MemoryCache::create_entry`](crate::MemoryCache::create_entry). The
/// entry is committed into its cache when it is dropped, but only once a value has
/// been set. Dropping an entry without a value leaves the cache untouched, so early
/// returns and panics between creation and [`set_value`](Self::set_value) never
/// publish partial state.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use std::time::Duration;
///
/// use memflight_tier::{CacheEntry, downcast_ref};
///
/// let committed = Arc::new(Mutex::new(None));
/// let sink = Arc::clone(&committed);
///
/// {
///     let mut entry = CacheEntry::new("greeting", move |key, value, options| {
///         *sink.lock().unwrap() = Some((key, value, options.time_to_live()));
///     });
///     entry.set_time_to_live(Duration::from_secs(60));
///     entry.set_value("hello".to_string());
/// } // committed here
///
/// let (key, value, ttl) = committed.lock().unwrap().take().unwrap();
/// assert_eq!(key, "greeting");
/// assert_eq!(downcast_ref::<String>(&value).map(String::as_str), Some("hello"));
/// assert_eq!(ttl, Some(Duration::from_secs(60)));
/// ```
pub struct CacheEntry<'a, K> {
    key: Option<K>,
    value: Option<CacheValue>,
    options: EntryOptions<K>,
    sink: Option<Sink<'a, K>>,
}

impl<'a, K> CacheEntry<'a, K> {
    /// Creates an entry that hands itself to `sink` on commit.
    pub fn new(key: K, sink: impl FnOnce(K, CacheValue, EntryOptions<K>) + Send + 'a) -> Self {
        Self {
            key: Some(key),
            value: None,
            options: EntryOptions::new(),
            sink: Some(Box::new(sink)),
        }
    }

    /// The key of the entry.
    #[must_use]
    pub fn key(&self) -> &K {
        match &self.key {
            Some(key) => key,
            None => unreachable!("the key is only taken while the entry is consumed"),
        }
    }

    /// The value set so far.
    #[must_use]
    pub fn value(&self) -> Option<&CacheValue> {
        self.value.as_ref()
    }

    /// Sets the value to commit.
    pub fn set_value<T: Any + Send + Sync>(&mut self, value: T) {
        self.value = Some(erase(value));
    }

    /// Sets an already erased value to commit.
    pub fn set_value_erased(&mut self, value: CacheValue) {
        self.value = Some(value);
    }

    /// The options the entry is committed with.
    #[must_use]
    pub fn options(&self) -> &EntryOptions<K> {
        &self.options
    }

    /// Mutable access to the options the entry is committed with.
    pub fn options_mut(&mut self) -> &mut EntryOptions<K> {
        &mut self.options
    }

    /// See [`EntryOptions::set_time_to_live`].
    pub fn set_time_to_live(&mut self, ttl: Duration) {
        self.options.set_time_to_live(ttl);
    }

    /// See [`EntryOptions::set_absolute_expiration`].
    pub fn set_absolute_expiration(&mut self, deadline: Instant) {
        self.options.set_absolute_expiration(deadline);
    }

    /// See [`EntryOptions::set_sliding_expiration`].
    pub fn set_sliding_expiration(&mut self, idle: Duration) {
        self.options.set_sliding_expiration(idle);
    }

    /// See [`EntryOptions::register_post_eviction_callback`].
    pub fn register_post_eviction_callback(&mut self, callback: EvictionCallback<K>) {
        self.options.register_post_eviction_callback(callback);
    }

    /// Commits the entry now. Without a value this is a no-op.
    pub fn commit(mut self) {
        self.flush();
    }

    /// Drops the entry without committing it.
    pub fn discard(mut self) {
        self.sink = None;
    }

    fn flush(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };

        if let (Some(sink), Some(key)) = (self.sink.take(), self.key.take()) {
            let options = std::mem::take(&mut self.options);
            sink(key, value, options);
        }
    }
}

impl<K: Debug> Debug for CacheEntry<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("has_value", &self.value.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<K> Drop for CacheEntry<'_, K> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::downcast_ref;

    type Committed = Arc<Mutex<Vec<(&'static str, CacheValue, Option<Duration>)>>>;

    fn recording(committed: &Committed) -> impl FnOnce(&'static str, CacheValue, EntryOptions<&'static str>) + Send + 'static {
        let committed = Arc::clone(committed);
        move |key, value, options| committed.lock().unwrap().push((key, value, options.time_to_live()))
    }

    #[test]
    fn drop_commits_value_with_options() {
        let committed = Committed::default();
        {
            let mut entry = CacheEntry::new("k", recording(&committed));
            entry.set_time_to_live(Duration::from_secs(1));
            entry.set_value(3_u8);
        }

        let committed = committed.lock().unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].0, "k");
        assert_eq!(downcast_ref::<u8>(&committed[0].1), Some(&3));
        assert_eq!(committed[0].2, Some(Duration::from_secs(1)));
    }

    #[test]
    fn drop_without_value_commits_nothing() {
        let committed = Committed::default();
        drop(CacheEntry::new("k", recording(&committed)));
        assert!(committed.lock().unwrap().is_empty());
    }

    #[test]
    fn discard_skips_commit() {
        let committed = Committed::default();
        let mut entry = CacheEntry::new("k", recording(&committed));
        entry.set_value(1_u8);
        entry.discard();
        assert!(committed.lock().unwrap().is_empty());
    }

    #[test]
    fn commit_happens_once() {
        let committed = Committed::default();
        let mut entry = CacheEntry::new("k", recording(&committed));
        entry.set_value(1_u8);
        entry.commit();
        assert_eq!(committed.lock().unwrap().len(), 1);
    }
}
