// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A process-local memory cache backed by moka.
//!
//! This crate provides [`InMemoryCache`], an implementation of
//! [`memflight_tier::MemoryCache`] on top of moka's concurrent cache. Use
//! [`InMemoryCacheBuilder`] to configure capacity without exposing moka types.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use memflight_memory::InMemoryCacheBuilder;
//! use memflight_tier::{EntryOptions, MemoryCache};
//! use tick::Clock;
//!
//! # let clock = Clock::new_frozen();
//! let cache = InMemoryCacheBuilder::<String>::new(clock)
//!     .max_capacity(1000)
//!     .build();
//!
//! cache.insert("key".to_string(), 42_i32, EntryOptions::new().with_time_to_live(Duration::from_secs(300)));
//! assert_eq!(cache.get::<i32>(&"key".to_string()), Some(42));
//! ```
//!
//! # Features
//!
//! - **Deterministic expiration**: every read checks the entry against the injected
//!   `tick::Clock`, so tests drive expiry with `ClockControl`
//! - **Capacity limits**: set a maximum entry count with automatic eviction
//! - **Eviction observers**: per-entry callbacks and cache-wide subscriptions
//! - **Atomic population**: `get_or_insert_with` holds moka's per-key lock while
//!   initializing

pub mod builder;
pub mod cache;

#[doc(inline)]
pub use builder::InMemoryCacheBuilder;
#[doc(inline)]
pub use cache::InMemoryCache;
