// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    fmt::Debug,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::EvictionCallback;

/// Expiration policy and eviction callbacks of a single cache entry.
///
/// Once an entry is written, the cache evaluates its deadline as the earliest of
/// the absolute expiration and "now plus the relative expiration". A sliding
/// expiration additionally expires the entry when it has not been read for the
/// given duration, but never extends it past the deadline.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use memflight_tier::EntryOptions;
///
/// let options = EntryOptions::<String>::new()
///     .with_time_to_live(Duration::from_secs(300))
///     .with_sliding_expiration(Duration::from_secs(30));
///
/// assert_eq!(options.time_to_live(), Some(Duration::from_secs(300)));
/// assert_eq!(options.sliding_expiration(), Some(Duration::from_secs(30)));
/// ```
pub struct EntryOptions<K> {
    absolute_expiration: Option<Instant>,
    expiration_relative_to_now: Option<Duration>,
    sliding_expiration: Option<Duration>,
    post_eviction_callbacks: Vec<EvictionCallback<K>>,
}

impl<K> EntryOptions<K> {
    /// Options without any expiration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            absolute_expiration: None,
            expiration_relative_to_now: None,
            sliding_expiration: None,
            post_eviction_callbacks: Vec::new(),
        }
    }

    /// Expires the entry `ttl` after it is written.
    #[must_use]
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.set_time_to_live(ttl);
        self
    }

    /// Expires the entry at `deadline`.
    #[must_use]
    pub fn with_absolute_expiration(mut self, deadline: Instant) -> Self {
        self.set_absolute_expiration(deadline);
        self
    }

    /// Expires the entry when it has not been read for `idle`.
    #[must_use]
    pub fn with_sliding_expiration(mut self, idle: Duration) -> Self {
        self.set_sliding_expiration(idle);
        self
    }

    /// Invokes `callback` once the entry leaves the cache.
    #[must_use]
    pub fn with_post_eviction_callback(mut self, callback: EvictionCallback<K>) -> Self {
        self.register_post_eviction_callback(callback);
        self
    }

    /// Sets the expiration relative to the time of writing.
    pub fn set_time_to_live(&mut self, ttl: Duration) {
        self.expiration_relative_to_now = Some(ttl);
    }

    /// Sets the absolute expiration.
    pub fn set_absolute_expiration(&mut self, deadline: Instant) {
        self.absolute_expiration = Some(deadline);
    }

    /// Sets the sliding expiration.
    pub fn set_sliding_expiration(&mut self, idle: Duration) {
        self.sliding_expiration = Some(idle);
    }

    /// Adds a post-eviction callback.
    pub fn register_post_eviction_callback(&mut self, callback: EvictionCallback<K>) {
        self.post_eviction_callbacks.push(callback);
    }

    /// The expiration relative to the time of writing.
    #[must_use]
    pub fn time_to_live(&self) -> Option<Duration> {
        self.expiration_relative_to_now
    }

    /// The absolute expiration.
    #[must_use]
    pub fn absolute_expiration(&self) -> Option<Instant> {
        self.absolute_expiration
    }

    /// The sliding expiration.
    #[must_use]
    pub fn sliding_expiration(&self) -> Option<Duration> {
        self.sliding_expiration
    }

    /// Returns the post-eviction callbacks.
    #[must_use]
    pub fn post_eviction_callbacks(&self) -> &[EvictionCallback<K>] {
        &self.post_eviction_callbacks
    }

    /// Takes the post-eviction callbacks out of the options.
    #[must_use]
    pub fn into_post_eviction_callbacks(self) -> Vec<EvictionCallback<K>> {
        self.post_eviction_callbacks
    }

    /// The instant after which an entry written at `now` is expired.
    ///
    /// A relative expiration that overflows `Instant` is treated as no expiration.
    #[must_use]
    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        let relative = self.expiration_relative_to_now.and_then(|ttl| now.checked_add(ttl));
        match (self.absolute_expiration, relative) {
            (Some(absolute), Some(relative)) => Some(absolute.min(relative)),
            (absolute, relative) => absolute.or(relative),
        }
    }
}

impl<K> Default for EntryOptions<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for EntryOptions<K> {
    fn clone(&self) -> Self {
        Self {
            absolute_expiration: self.absolute_expiration,
            expiration_relative_to_now: self.expiration_relative_to_now,
            sliding_expiration: self.sliding_expiration,
            post_eviction_callbacks: self.post_eviction_callbacks.clone(),
        }
    }
}

impl<K> Debug for EntryOptions<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryOptions")
            .field("absolute_expiration", &self.absolute_expiration)
            .field("expiration_relative_to_now", &self.expiration_relative_to_now)
            .field("sliding_expiration", &self.sliding_expiration)
            .field("post_eviction_callbacks", &self.post_eviction_callbacks.len())
            .finish()
    }
}

/// The expiration state of a stored entry.
///
/// Built from [`EntryOptions`] at write time. Cache implementations keep one per
/// entry, [`touch`](Self::touch) it on every read and ask [`is_expired`](Self::is_expired)
/// before serving it.
#[derive(Debug)]
pub struct Expiration {
    deadline: Option<Instant>,
    sliding: Option<Duration>,
    touched: Mutex<Instant>,
}

impl Expiration {
    /// Captures the expiration of an entry written at `now`.
    #[must_use]
    pub fn new<K>(options: &EntryOptions<K>, now: Instant) -> Self {
        Self {
            deadline: options.deadline(now),
            sliding: options.sliding_expiration(),
            touched: Mutex::new(now),
        }
    }

    /// Expiration that never elapses.
    #[must_use]
    pub fn never(now: Instant) -> Self {
        Self {
            deadline: None,
            sliding: None,
            touched: Mutex::new(now),
        }
    }

    /// The absolute deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` when the entry must no longer be served at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        if self.deadline.is_some_and(|deadline| now >= deadline) {
            return true;
        }

        self.sliding
            .is_some_and(|idle| now.saturating_duration_since(*self.touched.lock()) >= idle)
    }

    /// Records a read at `now`, which restarts the sliding window.
    pub fn touch(&self, now: Instant) {
        let mut touched = self.touched.lock();
        if now > *touched {
            *touched = now;
        }
    }

    /// How long the entry is still valid at `now` without further reads.
    ///
    /// `None` means it never expires.
    #[must_use]
    pub fn time_to_live(&self, now: Instant) -> Option<Duration> {
        let until_deadline = self.deadline.map(|deadline| deadline.saturating_duration_since(now));
        let until_idle = self.sliding.map(|idle| {
            let idle_for = now.saturating_duration_since(*self.touched.lock());
            idle.saturating_sub(idle_for)
        });

        match (until_deadline, until_idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Like [`time_to_live`](Self::time_to_live), assuming the entry is read at `now`.
    #[must_use]
    pub fn time_to_live_after_touch(&self, now: Instant) -> Option<Duration> {
        let until_deadline = self.deadline.map(|deadline| deadline.saturating_duration_since(now));
        match (until_deadline, self.sliding) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_deadline_wins() {
        let now = Instant::now();
        let options = EntryOptions::<()>::new()
            .with_time_to_live(Duration::from_secs(10))
            .with_absolute_expiration(now + Duration::from_secs(5));

        assert_eq!(options.deadline(now), Some(now + Duration::from_secs(5)));

        let options = options.with_absolute_expiration(now + Duration::from_secs(60));
        assert_eq!(options.deadline(now), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn no_expiration_by_default() {
        let now = Instant::now();
        let expiration = Expiration::new(&EntryOptions::<()>::default(), now);

        assert!(!expiration.is_expired(now + Duration::from_secs(86_400)));
        assert_eq!(expiration.time_to_live(now), None);
    }

    #[test]
    fn overflowing_ttl_means_no_deadline() {
        let now = Instant::now();
        let options = EntryOptions::<()>::new().with_time_to_live(Duration::MAX);
        assert_eq!(options.deadline(now), None);
    }

    #[test]
    fn sliding_window_restarts_on_touch() {
        let start = Instant::now();
        let options = EntryOptions::<()>::new().with_sliding_expiration(Duration::from_secs(10));
        let expiration = Expiration::new(&options, start);

        expiration.touch(start + Duration::from_secs(8));
        assert!(!expiration.is_expired(start + Duration::from_secs(15)));
        assert_eq!(
            expiration.time_to_live(start + Duration::from_secs(15)),
            Some(Duration::from_secs(3))
        );
        assert!(expiration.is_expired(start + Duration::from_secs(18)));
    }

    #[test]
    fn sliding_never_extends_past_deadline() {
        let start = Instant::now();
        let options = EntryOptions::<()>::new()
            .with_time_to_live(Duration::from_secs(10))
            .with_sliding_expiration(Duration::from_secs(5));
        let expiration = Expiration::new(&options, start);

        expiration.touch(start + Duration::from_secs(4));
        expiration.touch(start + Duration::from_secs(8));

        assert!(!expiration.is_expired(start + Duration::from_secs(9)));
        assert!(expiration.is_expired(start + Duration::from_secs(10)));
    }

    #[test]
    fn debug_hides_callbacks() {
        let options = EntryOptions::<()>::new().with_post_eviction_callback(std::sync::Arc::new(|_: &(), _: &crate::CacheValue, _: crate::EvictionReason| {}));
        let rendered = format!("{options:?}");
        assert!(rendered.contains("post_eviction_callbacks: 1"));
    }
}
