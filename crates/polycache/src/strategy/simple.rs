//! Plain TTL caching
//!
//! The baseline strategy: resolve the key, serve a stored value when one
//! exists, otherwise run the wrapped function and store its result under the
//! resolved TTL. One backend read on the hit path, one read plus at most one
//! write on the miss path.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use polycache_core::{
    CacheBackend, CacheError, CallArgs, CallEvent, CallOutcome, DetectionSink, FnSignature,
    JsonSerializer, KeyTemplate, NoopSink, Result, Serializer, TtlContext, TtlSpec, capture_value,
    resolve_ttl, resolve_ttl_static,
};

use crate::strategy::{CacheValue, Condition, Strategy, WrappedCall, store_always};
use crate::tags::TagRegistry;

/// Builder for [`SimpleCache`]
pub struct SimpleCacheBuilder<T, B, S = JsonSerializer> {
    backend: Arc<B>,
    signature: FnSignature,
    ttl: TtlSpec,
    key: Option<String>,
    prefix: String,
    condition: Condition<T>,
    tags: Vec<String>,
    registry: Option<Arc<TagRegistry>>,
    sink: Arc<dyn DetectionSink>,
    serializer: S,
}

impl<T, B, S> SimpleCacheBuilder<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
{
    /// Explicit key template, overriding the one derived from the signature.
    pub fn key(mut self, template: impl Into<String>) -> Self {
        self.key = Some(template.into());
        self
    }

    /// Prefix prepended to every key this registration produces, explicit
    /// templates included.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Only store results the predicate accepts.
    pub fn condition<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &CallArgs, &str) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(f);
        self
    }

    /// Attach a tag for bulk invalidation. Requires a registry.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Registry the tags are bound into.
    pub fn registry(mut self, registry: Arc<TagRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sink receiving one detection event per call.
    pub fn sink(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Swap the serializer.
    pub fn serializer<S2: Serializer>(self, serializer: S2) -> SimpleCacheBuilder<T, B, S2> {
        SimpleCacheBuilder {
            backend: self.backend,
            signature: self.signature,
            ttl: self.ttl,
            key: self.key,
            prefix: self.prefix,
            condition: self.condition,
            tags: self.tags,
            registry: self.registry,
            sink: self.sink,
            serializer,
        }
    }

    /// Validate the registration and build the strategy.
    pub fn build(self) -> Result<SimpleCache<T, B, S>> {
        let template = KeyTemplate::derive(&self.signature, self.key.as_deref(), &self.prefix)?;
        if !self.ttl.is_per_call() {
            resolve_ttl_static(&self.ttl)?;
        }
        let registry = bind_tags(&self.tags, self.registry, &template)?;
        Ok(SimpleCache {
            backend: self.backend,
            signature: self.signature,
            template,
            ttl: self.ttl,
            condition: self.condition,
            registry,
            sink: self.sink,
            serializer: self.serializer,
            _value: PhantomData,
        })
    }
}

/// Bind registration tags into the registry; tags without a registry are a
/// configuration error. Shared by every strategy builder that accepts tags.
pub(crate) fn bind_tags(
    tags: &[String],
    registry: Option<Arc<TagRegistry>>,
    template: &KeyTemplate,
) -> Result<Option<Arc<TagRegistry>>> {
    if tags.is_empty() {
        return Ok(registry);
    }
    let Some(registry) = registry else {
        return Err(CacheError::Configuration(format!(
            "tags {tags:?} declared without a tag registry"
        )));
    };
    for tag in tags {
        registry.bind(tag, template);
    }
    Ok(Some(registry))
}

/// Plain TTL cache over a wrapped callable
///
/// Generic over:
/// - `T`: the cached value
/// - `B`: the cache backend
/// - `S`: the serializer
pub struct SimpleCache<T, B, S = JsonSerializer> {
    backend: Arc<B>,
    signature: FnSignature,
    template: KeyTemplate,
    ttl: TtlSpec,
    condition: Condition<T>,
    registry: Option<Arc<TagRegistry>>,
    sink: Arc<dyn DetectionSink>,
    serializer: S,
    _value: PhantomData<fn() -> T>,
}

impl<T, B> SimpleCache<T, B>
where
    T: CacheValue,
    B: CacheBackend,
{
    /// Start a registration for one wrapped function.
    pub fn builder(
        backend: Arc<B>,
        signature: FnSignature,
        ttl: impl Into<TtlSpec>,
    ) -> SimpleCacheBuilder<T, B> {
        SimpleCacheBuilder {
            backend,
            signature,
            ttl: ttl.into(),
            key: None,
            prefix: String::new(),
            condition: store_always(),
            tags: Vec::new(),
            registry: None,
            sink: Arc::new(NoopSink),
            serializer: JsonSerializer,
        }
    }
}

impl<T, B, S> SimpleCache<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
{
    pub const NAME: &'static str = "cache";

    /// The key template this registration resolved to.
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
                debug!(target: "polycache", key, %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Resolve the TTL for this call and write the value. The write itself
    /// degrades to a no-op on backend failure; TTL resolution and
    /// serialization problems are real errors and surface.
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

        if let Some(value) = self.read(&key).await {
            self.emit(&key, CallOutcome::Hit, self.ttl.static_duration(), &value);
            return Ok(value);
        }

        let result = inner(args.clone()).await?;
        let mut ttl = None;
        if (self.condition)(&result, &args, &key) {
            ttl = Some(self.store(&key, &args, &result).await?);
        }
        self.emit(&key, CallOutcome::Miss, ttl, &result);
        Ok(result)
    }
}

impl<T, B, S> Strategy<T> for SimpleCache<T, B, S>
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

impl<T, B, S: Clone> Clone for SimpleCache<T, B, S> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            signature: self.signature.clone(),
            template: self.template.clone(),
            ttl: self.ttl.clone(),
            condition: self.condition.clone(),
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            serializer: self.serializer.clone(),
            _value: PhantomData,
        }
    }
}
