// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

/// A boxed error as returned by value factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error type of every memflight operation.
///
/// Errors are cheap to clone, so a single outcome of a shared factory execution can
/// be handed to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The options passed to the operation are invalid. Never retried.
    #[error("invalid cache options: {0}")]
    InvalidOptions(&'static str),

    /// The value factory failed. The original error is the [`source`](std::error::Error::source).
    #[error("value factory failed")]
    Factory(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The caller stopped waiting before a value was available.
    #[error("waiting for the value was cancelled")]
    Cancelled,

    /// The value factory panicked.
    #[error("value factory panicked")]
    FactoryPanicked,
}

impl Error {
    /// Wraps an error returned by a value factory.
    pub fn factory(error: impl Into<BoxError>) -> Self {
        Self::Factory(Arc::from(error.into()))
    }

    /// Returns the factory's own error if it is an `E`.
    ///
    /// # Examples
    ///
    /// ```
    /// use memflight::Error;
    ///
    /// let error = Error::factory(std::io::Error::other("backend down"));
    ///
    /// let io = error.factory_error::<std::io::Error>().unwrap();
    /// assert_eq!(io.to_string(), "backend down");
    /// assert!(error.factory_error::<std::fmt::Error>().is_none());
    /// ```
    #[must_use]
    pub fn factory_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Factory(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns `true` if the caller's wait was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the value factory failed or panicked.
    #[must_use]
    pub fn is_factory(&self) -> bool {
        matches!(self, Self::Factory(_) | Self::FactoryPanicked)
    }
}

/// A specialized [`Result`](std::result::Result) for memflight operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("not found: {0}")]
    struct NotFound(u32);

    #[test]
    fn factory_error_keeps_source_chain() {
        let error = Error::factory(NotFound(42));

        assert!(error.is_factory());
        assert!(!error.is_cancelled());
        assert_eq!(error.to_string(), "value factory failed");
        assert_eq!(error.source().map(ToString::to_string).as_deref(), Some("not found: 42"));
        assert_eq!(error.factory_error::<NotFound>().map(|e| e.0), Some(42));
    }

    #[test]
    fn string_errors_are_accepted() {
        let error = Error::factory("backend unavailable");
        assert_eq!(error.source().map(ToString::to_string).as_deref(), Some("backend unavailable"));
    }

    #[test]
    fn clones_share_the_source() {
        let error = Error::factory(NotFound(1));
        let clone = error.clone();

        let (Error::Factory(a), Error::Factory(b)) = (&error, &clone) else {
            panic!("expected factory errors");
        };
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn predicates() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::FactoryPanicked.is_factory());
        assert!(!Error::InvalidOptions("ttl").is_factory());
        assert_eq!(Error::InvalidOptions("ttl must be positive").to_string(), "invalid cache options: ttl must be positive");
    }
}
