//! Error types for cache and strategy operations

use std::sync::Arc;
use thiserror::Error;

/// Main error type for all cache operations
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Invalid registration-time or call-time configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backing store could not serve a required operation
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The wrapped function itself failed
    #[error("computation failed: {source}")]
    Computation {
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Fast-fail: the circuit guarding this resource is open
    #[error("circuit open for {resource}")]
    CircuitOpen { resource: String },

    /// Fast-fail: the rate window for this resource is exhausted
    #[error("rate limit exceeded for {resource}")]
    RateLimited { resource: String },

    /// A wait for another caller's in-flight computation ran out of time.
    /// Consumed internally by single-flight strategies, which promote the
    /// waiter to compute; callers never observe it.
    #[error("lock wait timed out for key: {0}")]
    LockTimeout(String),
}

impl CacheError {
    /// Wrap a failure of the wrapped function itself.
    pub fn computation<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CacheError::Computation {
            source: Arc::new(err),
        }
    }

    /// True when the wrapped function failed, as opposed to the cache
    /// machinery around it.
    pub fn is_computation(&self) -> bool {
        matches!(self, CacheError::Computation { .. })
    }

    /// Downcast the failure of a wrapped function to a concrete error type.
    /// Returns `None` for every other variant.
    pub fn computation_source<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            CacheError::Computation { source } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// True for infrastructure rejections (open circuit, exhausted rate
    /// window) that fail a call without running the wrapped function.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CacheError::CircuitOpen { .. } | CacheError::RateLimited { .. }
        )
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream said no")]
    struct UpstreamError;

    #[test]
    fn test_error_display() {
        let err = CacheError::Configuration("bad template".to_string());
        assert_eq!(err.to_string(), "configuration error: bad template");

        let err = CacheError::CircuitOpen {
            resource: "billing".to_string(),
        };
        assert_eq!(err.to_string(), "circuit open for billing");

        let err = CacheError::computation(UpstreamError);
        assert_eq!(err.to_string(), "computation failed: upstream said no");
    }

    #[test]
    fn test_error_clone() {
        let err = CacheError::computation(UpstreamError);
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn test_computation_downcast() {
        let err = CacheError::computation(UpstreamError);
        assert!(err.is_computation());
        assert!(err.computation_source::<UpstreamError>().is_some());
        assert!(err.computation_source::<std::io::Error>().is_none());

        let other = CacheError::LockTimeout("k".to_string());
        assert!(other.computation_source::<UpstreamError>().is_none());
    }

    #[test]
    fn test_rejections() {
        assert!(
            CacheError::RateLimited {
                resource: "api".to_string()
            }
            .is_rejection()
        );
        assert!(!CacheError::Serialization("oops".to_string()).is_rejection());
        assert!(!CacheError::computation(UpstreamError).is_rejection());
    }
}
