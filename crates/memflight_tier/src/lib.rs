// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! The process-local memory cache contract decorated by `memflight`.
//!
//! This crate defines the [`MemoryCache`] trait: a key/value store whose values are
//! type-erased ([`CacheValue`]), with per-entry expiration ([`EntryOptions`]), scoped
//! entry creation that commits on drop ([`CacheEntry`]), and eviction observers
//! ([`EvictionListeners`]).
//!
//! Storage, expiration and eviction policy belong to the implementation. The
//! decorators in `memflight` only rely on the operations of this trait.
//!
//! # Implementing a Memory Cache
//!
//! Only `try_get`, `set`, `remove`, `subscribe_evictions` and `clear` are required:
//!
//! ```
//! use std::collections::HashMap;
//! use std::sync::Mutex;
//!
//! use memflight_tier::{CacheValue, EntryOptions, EvictionCallback, EvictionListeners, EvictionSubscription, MemoryCache};
//!
//! #[derive(Default)]
//! struct Unbounded {
//!     values: Mutex<HashMap<String, CacheValue>>,
//!     listeners: EvictionListeners<String>,
//! }
//!
//! impl MemoryCache<String> for Unbounded {
//!     fn try_get(&self, key: &String) -> Option<CacheValue> {
//!         self.values.lock().unwrap().get(key).cloned()
//!     }
//!
//!     fn set(&self, key: String, value: CacheValue, _options: EntryOptions<String>) {
//!         self.values.lock().unwrap().insert(key, value);
//!     }
//!
//!     fn remove(&self, key: &String) {
//!         self.values.lock().unwrap().remove(key);
//!     }
//!
//!     fn subscribe_evictions(&self, callback: EvictionCallback<String>) -> EvictionSubscription {
//!         self.listeners.subscribe(callback)
//!     }
//!
//!     fn clear(&self) {
//!         self.values.lock().unwrap().clear();
//!     }
//! }
//!
//! let cache = Unbounded::default();
//! cache.insert("answer".to_string(), 42_u32, EntryOptions::new());
//! assert_eq!(cache.get::<u32>(&"answer".to_string()), Some(42));
//!
//! // A value of another type is a miss.
//! assert_eq!(cache.get::<String>(&"answer".to_string()), None);
//! ```

mod cache;
mod entry;
mod eviction;
mod options;
#[cfg(any(feature = "test-util", test))]
pub mod testing;
mod value;

#[doc(inline)]
pub use cache::MemoryCache;
#[doc(inline)]
pub use entry::CacheEntry;
#[doc(inline)]
pub use eviction::{EvictionCallback, EvictionListeners, EvictionReason, EvictionSubscription};
#[doc(inline)]
pub use options::{EntryOptions, Expiration};
#[doc(inline)]
pub use value::{CacheValue, downcast_ref, erase};
