//! Fixed-window rate limiting
//!
//! Counts calls per resolved key in a fixed window backed by an atomic
//! backend counter, so the budget is shared by every process using the same
//! backend. Calls over the limit fail fast with [`CacheError::RateLimited`]
//! without invoking the wrapped function. Rejected calls still count: a
//! client hammering a full window does not get a head start on the next one.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use polycache_core::{
    CacheBackend, CacheError, CallArgs, FnSignature, KeyTemplate, Result, TtlSpec,
    resolve_ttl_static,
};

use crate::strategy::{Strategy, WrappedCall};

/// Builder for [`RateLimiter`]
pub struct RateLimiterBuilder<B> {
    backend: Arc<B>,
    signature: FnSignature,
    limit: u64,
    window: TtlSpec,
    key: Option<String>,
    prefix: String,
}

impl<B: CacheBackend> RateLimiterBuilder<B> {
    pub fn key(mut self, template: impl Into<String>) -> Self {
        self.key = Some(template.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn build(self) -> Result<RateLimiter<B>> {
        let template = KeyTemplate::derive(&self.signature, self.key.as_deref(), &self.prefix)?;
        if self.limit == 0 {
            return Err(CacheError::Configuration(
                "rate limit must be at least 1".to_string(),
            ));
        }
        Ok(RateLimiter {
            backend: self.backend,
            signature: self.signature,
            template,
            limit: self.limit,
            window: resolve_ttl_static(&self.window)?,
        })
    }
}

/// Fixed-window rate limiter over a wrapped callable
pub struct RateLimiter<B> {
    backend: Arc<B>,
    signature: FnSignature,
    template: KeyTemplate,
    limit: u64,
    window: Duration,
}

impl<B: CacheBackend> RateLimiter<B> {
    pub const NAME: &'static str = "rate_limit";

    /// `limit` calls per `window`, counted per resolved key.
    pub fn builder(
        backend: Arc<B>,
        signature: FnSignature,
        limit: u64,
        window: impl Into<TtlSpec>,
    ) -> RateLimiterBuilder<B> {
        RateLimiterBuilder {
            backend,
            signature,
            limit,
            window: window.into(),
            key: None,
            prefix: "rate".to_string(),
        }
    }

    pub fn template(&self) -> &KeyTemplate {
        &self.template
    }

    fn resolve_key(&self, args: &CallArgs) -> Result<String> {
        let bound = self.signature.bind(args)?;
        self.template.resolve(&bound)
    }

    async fn call<T>(&self, args: CallArgs, inner: &WrappedCall<T>) -> Result<T>
    where
        T: Send + 'static,
    {
        let key = self.resolve_key(&args)?;
        let count = self.backend.incr(&key, Some(self.window)).await?;
        if count > self.limit as i64 {
            debug!(target: "polycache", resource = %key, count, limit = self.limit, "rate limit exceeded");
            return Err(CacheError::RateLimited { resource: key });
        }
        inner(args).await
    }
}

impl<T, B> Strategy<T> for RateLimiter<B>
where
    T: Send + 'static,
    B: CacheBackend,
{
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn wrap(&self, inner: WrappedCall<T>) -> WrappedCall<T> {
        let strategy = self.clone();
        Arc::new(move |args| {
            let strategy = strategy.clone();
            let inner = inner.clone();
            Box::pin(async move { strategy.call(args, &inner).await })
        })
    }
}

impl<B> Clone for RateLimiter<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            signature: self.signature.clone(),
            template: self.template.clone(),
            limit: self.limit,
            window: self.window,
        }
    }
}
