// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{any::Any, sync::Arc};

/// A type-erased cached value.
///
/// One cache instance holds values of many types. Readers assert the type they
/// expect with [`downcast_ref`]; a value of any other type reads as a miss.
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// Erases a value so it can be stored in a [`MemoryCache`](crate::MemoryCache).
///
/// # Examples
///
/// ```
/// use memflight_tier::{downcast_ref, erase};
///
/// let value = erase(7_u64);
/// assert_eq!(downcast_ref::<u64>(&value), Some(&7));
/// ```
pub fn erase<T: Any + Send + Sync>(value: T) -> CacheValue {
    Arc::new(value)
}

/// Returns the value as `T`, or `None` when it holds another type.
#[must_use]
pub fn downcast_ref<T: Any>(value: &CacheValue) -> Option<&T> {
    let value: &(dyn Any + Send + Sync) = value.as_ref();
    value.downcast_ref::<T>()
}
