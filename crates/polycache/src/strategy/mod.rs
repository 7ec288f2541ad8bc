//! The wrap-a-call contract
//!
//! Every strategy implements one contract: given an asynchronous callable,
//! produce a new callable with the policy applied. The wrapped callable is a
//! plain value, so policies compose by ordinary nesting; [`stack`] folds a
//! slice of strategies over a callable, first entry outermost. What each
//! layer does is invisible to the layers around it; a circuit breaker
//! wrapping a cache sees only another callable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use polycache_core::{CacheError, CallArgs, Result};

pub mod bloom;
pub mod circuit;
pub mod early;
pub mod failover;
pub mod locked;
pub mod rate;
pub mod simple;
pub mod soft;

/// Boxed future of one call's result.
pub type CallFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// An asynchronous callable over bound call arguments.
///
/// Both the input to [`Strategy::wrap`] and its output, so wrapped callables
/// wrap again.
pub type WrappedCall<T> = Arc<dyn Fn(CallArgs) -> CallFuture<T> + Send + Sync>;

/// Bounds a value must satisfy for a strategy to store and serve it.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A caching or resilience policy over an asynchronous callable.
pub trait Strategy<T>: Send + Sync {
    /// Strategy name, as reported in detection events.
    fn name(&self) -> &'static str;

    /// Wrap a callable, returning a new callable with this policy applied.
    fn wrap(&self, inner: WrappedCall<T>) -> WrappedCall<T>;
}

/// Adapt a plain async closure into a [`WrappedCall`].
pub fn wrap_fn<T, F, Fut>(f: F) -> WrappedCall<T>
where
    F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Compose strategies over a callable, first strategy outermost.
///
/// `stack(&[a, b], call)` routes every invocation through `a`, then `b`,
/// then `call`. An empty slice returns the callable unchanged.
pub fn stack<T>(strategies: &[Arc<dyn Strategy<T>>], call: WrappedCall<T>) -> WrappedCall<T> {
    strategies
        .iter()
        .rev()
        .fold(call, |inner, strategy| strategy.wrap(inner))
}

/// Predicate deciding whether a computed result should be stored.
///
/// Receives the result, the call's arguments and the resolved key.
pub type Condition<T> = Arc<dyn Fn(&T, &CallArgs, &str) -> bool + Send + Sync>;

/// Predicate matching the computation failures a fallback path intercepts.
pub type FailurePredicate = Arc<dyn Fn(&CacheError) -> bool + Send + Sync>;

pub(crate) fn store_always<T>() -> Condition<T> {
    Arc::new(|_, _, _| true)
}

/// Matches any failure of the wrapped function itself; infrastructure
/// errors never match.
pub fn any_computation_failure() -> FailurePredicate {
    Arc::new(|err: &CacheError| err.is_computation())
}

/// Matches computation failures whose source downcasts to `E`.
pub fn computation_failure_of<E>() -> FailurePredicate
where
    E: std::error::Error + 'static,
{
    Arc::new(|err: &CacheError| err.computation_source::<E>().is_some())
}

/// Random token identifying one lock holder.
pub(crate) fn lock_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}
