//! Single-flight caching
//!
//! At most one caller computes a given key at a time. The first caller to
//! miss acquires a per-key lock marker, computes, stores, and releases;
//! concurrent callers poll the cache until the value lands and are served
//! without ever running the wrapped function. Because the marker expires, a
//! crashed holder only ever delays waiters: a waiter whose patience runs out
//! is promoted and computes the value itself.
//!
//! Unlike the freshness strategies, correctness here depends on the backend
//! honoring the lock contract, so lock operations surface backend errors
//! instead of degrading.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use polycache_core::{
    CacheBackend, CacheError, CallArgs, CallEvent, CallOutcome, DetectionSink, FnSignature,
    JsonSerializer, KeyTemplate, NoopSink, Result, Serializer, TtlContext, TtlSpec, capture_value,
    resolve_ttl, resolve_ttl_static,
};

use crate::strategy::simple::bind_tags;
use crate::strategy::{CacheValue, Condition, Strategy, WrappedCall, lock_token, store_always};
use crate::tags::TagRegistry;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);
const DEFAULT_WAIT_STEP: Duration = Duration::from_millis(100);

/// Builder for [`Locked`]
pub struct LockedBuilder<T, B, S = JsonSerializer> {
    backend: Arc<B>,
    signature: FnSignature,
    ttl: TtlSpec,
    lock_ttl: TtlSpec,
    wait_timeout: Option<TtlSpec>,
    wait_step: TtlSpec,
    key: Option<String>,
    prefix: String,
    condition: Condition<T>,
    tags: Vec<String>,
    registry: Option<Arc<TagRegistry>>,
    sink: Arc<dyn DetectionSink>,
    serializer: S,
}

impl<T, B, S> LockedBuilder<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
{
    /// Lifetime of the lock marker. The upper bound on how long a crashed
    /// holder can block the key.
    pub fn lock_ttl(mut self, ttl: impl Into<TtlSpec>) -> Self {
        self.lock_ttl = ttl.into();
        self
    }

    /// How long a waiter polls before being promoted to compute the value
    /// itself. Defaults to the lock TTL.
    pub fn wait_timeout(mut self, timeout: impl Into<TtlSpec>) -> Self {
        self.wait_timeout = Some(timeout.into());
        self
    }

    /// Poll interval while waiting on another caller's computation.
    pub fn wait_step(mut self, step: impl Into<TtlSpec>) -> Self {
        self.wait_step = step.into();
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

    pub fn serializer<S2: Serializer>(self, serializer: S2) -> LockedBuilder<T, B, S2> {
        LockedBuilder {
            backend: self.backend,
            signature: self.signature,
            ttl: self.ttl,
            lock_ttl: self.lock_ttl,
            wait_timeout: self.wait_timeout,
            wait_step: self.wait_step,
            key: self.key,
            prefix: self.prefix,
            condition: self.condition,
            tags: self.tags,
            registry: self.registry,
            sink: self.sink,
            serializer,
        }
    }

    pub fn build(self) -> Result<Locked<T, B, S>> {
        let template = KeyTemplate::derive(&self.signature, self.key.as_deref(), &self.prefix)?;
        if !self.ttl.is_per_call() {
            resolve_ttl_static(&self.ttl)?;
        }
        let lock_ttl = resolve_ttl_static(&self.lock_ttl)?;
        let wait_timeout = match &self.wait_timeout {
            Some(spec) => resolve_ttl_static(spec)?,
            None => lock_ttl,
        };
        let wait_step = resolve_ttl_static(&self.wait_step)?;
        if wait_step.is_zero() {
            return Err(CacheError::Configuration(
                "wait step must be non-zero".to_string(),
            ));
        }
        let registry = bind_tags(&self.tags, self.registry, &template)?;
        Ok(Locked {
            backend: self.backend,
            signature: self.signature,
            template,
            ttl: self.ttl,
            lock_ttl,
            wait_timeout,
            wait_step,
            condition: self.condition,
            registry,
            sink: self.sink,
            serializer: self.serializer,
            _value: PhantomData,
        })
    }
}

/// Single-flight cache over a wrapped callable
pub struct Locked<T, B, S = JsonSerializer> {
    backend: Arc<B>,
    signature: FnSignature,
    template: KeyTemplate,
    ttl: TtlSpec,
    lock_ttl: Duration,
    wait_timeout: Duration,
    wait_step: Duration,
    condition: Condition<T>,
    registry: Option<Arc<TagRegistry>>,
    sink: Arc<dyn DetectionSink>,
    serializer: S,
    _value: PhantomData<fn() -> T>,
}

impl<T, B> Locked<T, B>
where
    T: CacheValue,
    B: CacheBackend,
{
    pub fn builder(
        backend: Arc<B>,
        signature: FnSignature,
        ttl: impl Into<TtlSpec>,
    ) -> LockedBuilder<T, B> {
        LockedBuilder {
            backend,
            signature,
            ttl: ttl.into(),
            lock_ttl: TtlSpec::Fixed(DEFAULT_LOCK_TTL),
            wait_timeout: None,
            wait_step: TtlSpec::Fixed(DEFAULT_WAIT_STEP),
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

impl<T, B, S> Locked<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
{
    pub const NAME: &'static str = "locked";

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
        // Degrades like the freshness strategies: a failed write costs the
        // waiters their wait and they get promoted, nothing worse.
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

    /// Best-effort release; a marker that outlives a failed release expires
    /// on its own TTL.
    async fn release(&self, lock_key: &str, token: &str) {
        if let Err(err) = self.backend.release_lock(lock_key, token).await {
            debug!(target: "polycache", lock_key, %err, "lock release failed, marker will expire");
        }
    }

    /// Poll the cache until the lock holder's value lands or the wait
    /// budget runs out.
    async fn wait_for_value(&self, key: &str) -> Result<T> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            tokio::time::sleep(self.wait_step).await;
            if let Some(value) = self.read(key).await {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(CacheError::LockTimeout(key.to_string()));
            }
        }
    }

    async fn compute_and_store(&self, key: &str, args: &CallArgs, inner: &WrappedCall<T>) -> Result<T> {
        let result = inner(args.clone()).await?;
        let mut ttl = None;
        if (self.condition)(&result, args, key) {
            ttl = Some(self.store(key, args, &result).await?);
        }
        self.emit(key, CallOutcome::Miss, ttl, &result);
        Ok(result)
    }

    async fn call(&self, args: CallArgs, inner: &WrappedCall<T>) -> Result<T> {
        let key = self.resolve_key(&args)?;

        if let Some(value) = self.read(&key).await {
            self.emit(&key, CallOutcome::Hit, self.ttl.static_duration(), &value);
            return Ok(value);
        }

        let lock_key = format!("{key}:lock");
        let token = lock_token();
        if self.backend.acquire_lock(&lock_key, &token, self.lock_ttl).await? {
            // Someone may have filled the key between the miss and the
            // acquisition; serving it keeps the computation single-flight.
            if let Some(value) = self.read(&key).await {
                self.release(&lock_key, &token).await;
                self.emit(&key, CallOutcome::Locked, None, &value);
                return Ok(value);
            }

            let result = self.compute_and_store(&key, &args, inner).await;
            self.release(&lock_key, &token).await;
            return result;
        }

        match self.wait_for_value(&key).await {
            Ok(value) => {
                self.emit(&key, CallOutcome::Locked, None, &value);
                Ok(value)
            }
            Err(CacheError::LockTimeout(_)) => {
                debug!(target: "polycache", key = %key, "lock wait exhausted, promoting waiter");
                self.compute_and_store(&key, &args, inner).await
            }
            Err(err) => Err(err),
        }
    }
}

impl<T, B, S> Strategy<T> for Locked<T, B, S>
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

impl<T, B, S: Clone> Clone for Locked<T, B, S> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            signature: self.signature.clone(),
            template: self.template.clone(),
            ttl: self.ttl.clone(),
            lock_ttl: self.lock_ttl,
            wait_timeout: self.wait_timeout,
            wait_step: self.wait_step,
            condition: self.condition.clone(),
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            serializer: self.serializer.clone(),
            _value: PhantomData,
        }
    }
}
