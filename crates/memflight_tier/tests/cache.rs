// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for `MemoryCache` trait default implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use memflight_tier::{
    CacheValue, EntryOptions, EvictionCallback, EvictionListeners, EvictionReason, EvictionSubscription, MemoryCache, downcast_ref, erase,
};

/// Minimal implementation that only provides required methods
#[derive(Default)]
struct MinimalCache {
    data: Mutex<HashMap<String, (CacheValue, Option<Duration>)>>,
    listeners: EvictionListeners<String>,
}

impl MemoryCache<String> for MinimalCache {
    fn try_get(&self, key: &String) -> Option<CacheValue> {
        self.data.lock().expect("lock poisoned").get(key).map(|(value, _)| Arc::clone(value))
    }

    fn set(&self, key: String, value: CacheValue, options: EntryOptions<String>) {
        self.data
            .lock()
            .expect("lock poisoned")
            .insert(key, (value, options.time_to_live()));
    }

    fn remove(&self, key: &String) {
        let removed = self.data.lock().expect("lock poisoned").remove(key);
        if let Some((value, _)) = removed {
            self.listeners.notify(key, &value, EvictionReason::Removed);
        }
    }

    fn subscribe_evictions(&self, callback: EvictionCallback<String>) -> EvictionSubscription {
        self.listeners.subscribe(callback)
    }

    fn clear(&self) {
        self.data.lock().expect("lock poisoned").clear();
    }
}

impl MinimalCache {
    fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.data.lock().expect("lock poisoned").get(key).and_then(|(_, ttl)| *ttl)
    }
}

#[test]
fn minimal_cache_get_miss() {
    let cache = MinimalCache::default();
    assert_eq!(cache.get::<i32>(&"key".to_string()), None);
    assert_eq!(cache.len(), None);
}

#[test]
fn typed_read_of_other_type_is_miss() {
    let cache = MinimalCache::default();
    cache.insert("key".to_string(), 42_i32, EntryOptions::new());

    assert_eq!(cache.get::<i32>(&"key".to_string()), Some(42));
    assert_eq!(cache.get::<i64>(&"key".to_string()), None);
}

#[test]
fn create_entry_commits_through_set() {
    let cache = MinimalCache::default();

    let mut entry = cache.create_entry("key".to_string());
    entry.set_time_to_live(Duration::from_secs(30));
    entry.set_value("value".to_string());
    assert_eq!(entry.key(), "key");
    entry.commit();

    assert_eq!(cache.get::<String>(&"key".to_string()).as_deref(), Some("value"));
    assert_eq!(cache.ttl_of("key"), Some(Duration::from_secs(30)));
}

#[test]
fn create_entry_without_value_leaves_cache_untouched() {
    let cache = MinimalCache::default();

    let mut entry = cache.create_entry("key".to_string());
    entry.set_time_to_live(Duration::from_secs(30));
    drop(entry);

    assert!(cache.try_get(&"key".to_string()).is_none());
}

#[test]
fn default_get_or_insert_with_reads_then_writes() {
    let cache = MinimalCache::default();
    let mut calls = 0;

    for _ in 0..3 {
        let value = cache.get_or_insert_with(
            "key".to_string(),
            &mut |value| downcast_ref::<u32>(value).is_some(),
            &mut || {
                calls += 1;
                (erase(9_u32), EntryOptions::new())
            },
        );
        assert_eq!(downcast_ref::<u32>(&value), Some(&9));
    }

    assert_eq!(calls, 1);
}

#[test]
fn arc_forwards_to_inner_cache() {
    let cache = Arc::new(MinimalCache::default());
    let removed = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&removed);
    let _subscription = MemoryCache::subscribe_evictions(
        &cache,
        Arc::new(move |key: &String, _: &CacheValue, reason: EvictionReason| sink.lock().expect("lock poisoned").push((key.clone(), reason))),
    );

    MemoryCache::insert(&cache, "key".to_string(), 1_u8, EntryOptions::new());
    assert_eq!(MemoryCache::get::<u8>(&cache, &"key".to_string()), Some(1));

    MemoryCache::remove(&cache, &"key".to_string());
    assert_eq!(
        *removed.lock().expect("lock poisoned"),
        vec![("key".to_string(), EvictionReason::Removed)]
    );
}

#[test]
fn trait_is_object_safe() {
    let cache: Box<dyn MemoryCache<String>> = Box::new(MinimalCache::default());
    cache.set("key".to_string(), erase(1_u8), EntryOptions::new());
    assert!(cache.try_get(&"key".to_string()).is_some());

    cache.clear();
    assert!(cache.try_get(&"key".to_string()).is_none());
}
