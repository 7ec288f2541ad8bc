//! Soft-expiration caching
//!
//! Values carry two lifetimes: a logical one (the soft window) and the
//! physical TTL the backend enforces. Within the soft window calls are
//! served from cache. Past it the wrapped function runs again, and if it
//! fails with a matching error while the physically-live entry is still
//! around, the stale value is served instead of the failure.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use polycache_core::{
    CacheBackend, CacheError, CallArgs, CallEvent, CallOutcome, DetectionSink, FnSignature,
    JsonSerializer, KeyTemplate, NoopSink, Result, Serializer, SoftEntry, TtlContext, TtlSpec,
    capture_value, resolve_ttl, resolve_ttl_static,
};

use crate::strategy::simple::bind_tags;
use crate::strategy::{
    CacheValue, Condition, FailurePredicate, Strategy, WrappedCall, any_computation_failure,
    store_always,
};
use crate::tags::TagRegistry;

/// Fraction of the physical TTL used as the soft window when none is given.
const DEFAULT_SOFT_RATIO: f64 = 0.33;

/// Builder for [`SoftCache`]
pub struct SoftCacheBuilder<T, B, S = JsonSerializer> {
    backend: Arc<B>,
    signature: FnSignature,
    ttl: TtlSpec,
    soft_ttl: Option<TtlSpec>,
    soft_ratio: f64,
    key: Option<String>,
    prefix: String,
    condition: Condition<T>,
    failover: FailurePredicate,
    tags: Vec<String>,
    registry: Option<Arc<TagRegistry>>,
    sink: Arc<dyn DetectionSink>,
    serializer: S,
}

impl<T, B, S> SoftCacheBuilder<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
{
    /// The soft window. Defaults to a fraction of the physical TTL. Must
    /// not be per-call.
    pub fn soft_ttl(mut self, soft_ttl: impl Into<TtlSpec>) -> Self {
        self.soft_ttl = Some(soft_ttl.into());
        self
    }

    /// Fraction of the physical TTL used as the soft window when no
    /// explicit `soft_ttl` is given. Must be in `(0, 1]`.
    pub fn soft_ratio(mut self, ratio: f64) -> Self {
        self.soft_ratio = ratio;
        self
    }

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

    /// Which computation failures fall back to the stale value. Defaults to
    /// every computation failure; infrastructure errors never qualify.
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

    pub fn serializer<S2: Serializer>(self, serializer: S2) -> SoftCacheBuilder<T, B, S2> {
        SoftCacheBuilder {
            backend: self.backend,
            signature: self.signature,
            ttl: self.ttl,
            soft_ttl: self.soft_ttl,
            soft_ratio: self.soft_ratio,
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

    pub fn build(self) -> Result<SoftCache<T, B, S>> {
        let template = KeyTemplate::derive(&self.signature, self.key.as_deref(), &self.prefix)?;
        if !self.ttl.is_per_call() {
            resolve_ttl_static(&self.ttl)?;
        }
        if let Some(soft) = &self.soft_ttl {
            // The soft window pins the entry's stale point at write time;
            // a per-call window would make freshness ambiguous.
            resolve_ttl_static(soft)?;
        }
        if !(self.soft_ratio > 0.0 && self.soft_ratio <= 1.0) {
            return Err(CacheError::Configuration(format!(
                "soft_ratio must be in (0, 1], got {}",
                self.soft_ratio
            )));
        }
        let registry = bind_tags(&self.tags, self.registry, &template)?;
        Ok(SoftCache {
            backend: self.backend,
            signature: self.signature,
            template,
            ttl: self.ttl,
            soft_ttl: self.soft_ttl,
            soft_ratio: self.soft_ratio,
            condition: self.condition,
            failover: self.failover,
            registry,
            sink: self.sink,
            serializer: self.serializer,
            _value: PhantomData,
        })
    }
}

/// Soft-expiration cache over a wrapped callable
pub struct SoftCache<T, B, S = JsonSerializer> {
    backend: Arc<B>,
    signature: FnSignature,
    template: KeyTemplate,
    ttl: TtlSpec,
    soft_ttl: Option<TtlSpec>,
    soft_ratio: f64,
    condition: Condition<T>,
    failover: FailurePredicate,
    registry: Option<Arc<TagRegistry>>,
    sink: Arc<dyn DetectionSink>,
    serializer: S,
    _value: PhantomData<fn() -> T>,
}

impl<T, B> SoftCache<T, B>
where
    T: CacheValue,
    B: CacheBackend,
{
    pub fn builder(
        backend: Arc<B>,
        signature: FnSignature,
        ttl: impl Into<TtlSpec>,
    ) -> SoftCacheBuilder<T, B> {
        SoftCacheBuilder {
            backend,
            signature,
            ttl: ttl.into(),
            soft_ttl: None,
            soft_ratio: DEFAULT_SOFT_RATIO,
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

impl<T, B, S> SoftCache<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
{
    pub const NAME: &'static str = "soft";

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

    async fn read(&self, key: &str) -> Option<SoftEntry<T>> {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match self.serializer.deserialize::<SoftEntry<T>>(&bytes) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    debug!(target: "polycache", key, %err, "discarding undecodable entry");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                debug!(target: "polycache", key, %err, "cache read failed, treating as miss");
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
        // The logical window never exceeds the physical one.
        let soft_ttl = match &self.soft_ttl {
            Some(spec) => resolve_ttl_static(spec)?.min(ttl),
            None => ttl.mul_f64(self.soft_ratio),
        };
        let entry = SoftEntry::new(value.clone(), soft_ttl);
        let bytes = self.serializer.serialize(&entry)?;
        if let Err(err) = self.backend.set(key, bytes, Some(ttl), false).await {
            debug!(target: "polycache", key, %err, "cache write failed, result not stored");
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
        let cached = self.read(&key).await;

        if let Some(entry) = &cached {
            if entry.is_fresh() {
                self.emit(&key, CallOutcome::Soft, self.ttl.static_duration(), &entry.value);
                return Ok(entry.value.clone());
            }
        }

        match inner(args.clone()).await {
            Ok(result) => {
                let mut ttl = None;
                if (self.condition)(&result, &args, &key) {
                    ttl = Some(self.store(&key, &args, &result).await?);
                }
                self.emit(&key, CallOutcome::Miss, ttl, &result);
                Ok(result)
            }
            Err(err) if (self.failover)(&err) => match cached {
                Some(entry) => {
                    debug!(target: "polycache", key = %key, %err, "serving stale value after failure");
                    self.emit(&key, CallOutcome::Stale, None, &entry.value);
                    Ok(entry.value)
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

impl<T, B, S> Strategy<T> for SoftCache<T, B, S>
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

impl<T, B, S: Clone> Clone for SoftCache<T, B, S> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            signature: self.signature.clone(),
            template: self.template.clone(),
            ttl: self.ttl.clone(),
            soft_ttl: self.soft_ttl.clone(),
            soft_ratio: self.soft_ratio,
            condition: self.condition.clone(),
            failover: self.failover.clone(),
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            serializer: self.serializer.clone(),
            _value: PhantomData,
        }
    }
}
