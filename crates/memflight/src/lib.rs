// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Single-flight and stale-while-revalidate decorators over a process-local memory cache.
//!
//! Each decorator wraps any [`MemoryCache`] and adds one population discipline:
//!
//! - [`SingleFlightCache`]: a per-key gate serializes factory runs. Failures stay
//!   with the caller that ran the factory.
//! - [`SingleFlightLazyCache`]: the in-flight [`Flight`] handle is stored in the
//!   cache, and the cache's own per-key atomicity picks the single runner.
//!   Failures are shared.
//! - [`CoalescingMemoryCache`]: a drop-in [`MemoryCache`] keeping in-flight
//!   handles in a registry next to the cache. Failures are shared.
//! - [`SwrCache`]: serves stale values while at most one background refresh runs
//!   per key.
//!
//! Waiting callers suspend without blocking their thread. A caller's
//! [`CancellationToken`] only ends its own wait; work shared with other callers
//! runs to completion.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use memflight::{CancellationToken, InMemoryCache, SingleFlightLazyCache};
//! use tick::Clock;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> memflight::Result<()> {
//! let cache = SingleFlightLazyCache::new(InMemoryCache::new(Clock::new_frozen()));
//! let cancel = CancellationToken::new();
//!
//! let lookups = (0..8).map(|_| {
//!     cache.get_or_create("user:42", Duration::from_secs(300), || async {
//!         Ok::<_, std::io::Error>("Ferris".to_string())
//!     }, &cancel)
//! });
//!
//! for name in futures::future::join_all(lookups).await {
//!     assert_eq!(name?, "Ferris");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `memory` (default): re-exports [`InMemoryCache`], the moka-backed cache.
//! - `test-util`: enables `memflight_tier::testing` and frozen `tick` clocks.

mod coalescing;
mod error;
mod flight;
mod lazy;
mod single_flight;
mod swr;
mod telemetry;

#[doc(inline)]
pub use coalescing::{Coalesced, CoalescingMemoryCache};
#[doc(inline)]
pub use error::{BoxError, Error, Result};
#[doc(inline)]
pub use flight::Flight;
#[doc(inline)]
pub use lazy::SingleFlightLazyCache;
#[cfg(feature = "memory")]
#[doc(inline)]
pub use memflight_memory::{InMemoryCache, InMemoryCacheBuilder};
#[doc(inline)]
pub use memflight_tier::{
    CacheEntry, CacheValue, EntryOptions, EvictionCallback, EvictionReason, EvictionSubscription, MemoryCache, downcast_ref, erase,
};
#[doc(inline)]
pub use single_flight::SingleFlightCache;
#[doc(inline)]
pub use swr::{SwrCache, SwrOptions};
#[doc(inline)]
pub use tokio_util::sync::CancellationToken;
