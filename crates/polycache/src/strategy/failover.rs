//! Fail-safe caching
//!
//! Inverts the usual order: the wrapped function runs on every call and the
//! cache is only consulted when it fails. Successful results are stored as
//! fallback material; a failure matching the predicate is answered with the
//! last stored value when one is still retained.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use polycache_core::{
    CacheBackend, CacheError, CallArgs, CallEvent, CallOutcome, DetectionSink, FnSignature,
    JsonSerializer, KeyTemplate, NoopSink, Result, Serializer, TtlContext, TtlSpec, capture_value,
    resolve_ttl, resolve_ttl_static,
};

use crate::strategy::simple::bind_tags;
use crate::strategy::{
    CacheValue, Condition, FailurePredicate, Strategy, WrappedCall, any_computation_failure,
    store_always,
};
use crate::tags::TagRegistry;

/// Builder for [`FailoverCache`]
pub struct FailoverCacheBuilder<T, B, S = JsonSerializer> {
    backend: Arc<B>,
    signature: FnSignature,
    ttl: TtlSpec,
    key: Option<String>,
    prefix: String,
    condition: Condition<T>,
    failover: FailurePredicate,
    tags: Vec<String>,
    registry: Option<Arc<TagRegistry>>,
    sink: Arc<dyn DetectionSink>,
    serializer: S,
}

impl<T, B, S> FailoverCacheBuilder<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
{
    pub fn key(mut self, template: impl Into<String>) -> Self {
        self.key = Some(template.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn condition<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &CallArgs, &str) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(f);
        self
    }

    /// Which computation failures are answered from the fallback store.
    pub fn failover_on(mut self, predicate: FailurePredicate) -> Self {
        self.failover = predicate;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn registry(mut self, registry: Arc<TagRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn serializer<S2: Serializer>(self, serializer: S2) -> FailoverCacheBuilder<T, B, S2> {
        FailoverCacheBuilder {
            backend: self.backend,
            signature: self.signature,
            ttl: self.ttl,
            key: self.key,
            prefix: self.prefix,
            condition: self.condition,
            failover: self.failover,
            tags: self.tags,
            registry: self.registry,
            sink: self.sink,
            serializer,
        }
    }

    pub fn build(self) -> Result<FailoverCache<T, B, S>> {
        let template = KeyTemplate::derive(&self.signature, self.key.as_deref(), &self.prefix)?;
        if !self.ttl.is_per_call() {
            resolve_ttl_static(&self.ttl)?;
        }
        let registry = bind_tags(&self.tags, self.registry, &template)?;
        Ok(FailoverCache {
            backend: self.backend,
            signature: self.signature,
            template,
            ttl: self.ttl,
            condition: self.condition,
            failover: self.failover,
            registry,
            sink: self.sink,
            serializer: self.serializer,
            _value: PhantomData,
        })
    }
}

/// Fail-safe cache over a wrapped callable
pub struct FailoverCache<T, B, S = JsonSerializer> {
    backend: Arc<B>,
    signature: FnSignature,
    template: KeyTemplate,
    ttl: TtlSpec,
    condition: Condition<T>,
    failover: FailurePredicate,
    registry: Option<Arc<TagRegistry>>,
    sink: Arc<dyn DetectionSink>,
    serializer: S,
    _value: PhantomData<fn() -> T>,
}

impl<T, B> FailoverCache<T, B>
where
    T: CacheValue,
    B: CacheBackend,
{
    pub fn builder(
        backend: Arc<B>,
        signature: FnSignature,
        ttl: impl Into<TtlSpec>,
    ) -> FailoverCacheBuilder<T, B> {
        FailoverCacheBuilder {
            backend,
            signature,
            ttl: ttl.into(),
            key: None,
            prefix: String::new(),
            condition: store_always(),
            failover: any_computation_failure(),
            tags: Vec::new(),
            registry: None,
            sink: Arc::new(NoopSink),
            serializer: JsonSerializer,
        }
    }
}

impl<T, B, S> FailoverCache<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
{
    pub const NAME: &'static str = "failover";

    pub fn template(&self) -> &KeyTemplate {
        &self.template
    }

    fn resolve_key(&self, args: &CallArgs) -> Result<String> {
        let bound = self.signature.bind(args)?;
        let key = self.template.resolve(&bound)?;
        Ok(match &self.registry {
            Some(registry) => registry.qualify(&self.template, key),
            None => key,
        })
    }

    async fn read(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match self.serializer.deserialize::<T>(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    debug!(target: "polycache", key, %err, "discarding undecodable entry");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                debug!(target: "polycache", key, %err, "fallback read failed");
                None
            }
        }
    }

    async fn store(&self, key: &str, args: &CallArgs, value: &T) -> Result<Duration> {
        let result_value = match &self.ttl {
            TtlSpec::PerCall(_) => Some(
                serde_json::to_value(value)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?,
            ),
            _ => None,
        };
        let ttl = resolve_ttl(
            &self.ttl,
            &TtlContext {
                args,
                result: result_value.as_ref(),
            },
        )?;
        let bytes = self.serializer.serialize(value)?;
        if let Err(err) = self.backend.set(key, bytes, Some(ttl), false).await {
            debug!(target: "polycache", key, %err, "fallback write failed");
        }
        Ok(ttl)
    }

    fn emit(&self, key: &str, outcome: CallOutcome, ttl: Option<Duration>, value: &T) {
        self.sink.record(CallEvent {
            key: key.to_string(),
            template: self.template.source().to_string(),
            strategy: Self::NAME,
            outcome,
            ttl,
            value: capture_value(self.sink.as_ref(), value),
        });
    }

    async fn call(&self, args: CallArgs, inner: &WrappedCall<T>) -> Result<T> {
        let key = self.resolve_key(&args)?;

        match inner(args.clone()).await {
            Ok(result) => {
                let mut ttl = None;
                if (self.condition)(&result, &args, &key) {
                    ttl = Some(self.store(&key, &args, &result).await?);
                }
                self.emit(&key, CallOutcome::Miss, ttl, &result);
                Ok(result)
            }
            Err(err) if (self.failover)(&err) => match self.read(&key).await {
                Some(value) => {
                    debug!(target: "polycache", key = %key, %err, "serving fallback value after failure");
                    self.emit(&key, CallOutcome::Stale, None, &value);
                    Ok(value)
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

impl<T, B, S> Strategy<T> for FailoverCache<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
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

impl<T, B, S: Clone> Clone for FailoverCache<T, B, S> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            signature: self.signature.clone(),
            template: self.template.clone(),
            ttl: self.ttl.clone(),
            condition: self.condition.clone(),
            failover: self.failover.clone(),
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            serializer: self.serializer.clone(),
            _value: PhantomData,
        }
    }
}
