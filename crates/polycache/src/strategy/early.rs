//! Early refresh ahead of expiration
//!
//! Extends soft expiration with background recomputation. While an entry is
//! within its early window it is served as a plain hit. Once the window has
//! passed (but the entry is still physically live) a call can trigger a
//! refresh in a background task and still return the current value
//! immediately, so no caller ever waits on the recomputation. A per-key
//! refresh lock keeps concurrent triggers down to one running refresh.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use polycache_core::{
    CacheBackend, CacheError, CallArgs, CallEvent, CallOutcome, DetectionSink, FnSignature,
    JsonSerializer, KeyTemplate, NoopSink, Result, Serializer, SoftEntry, TtlContext, TtlSpec,
    capture_value, resolve_ttl, resolve_ttl_static,
};

use crate::strategy::simple::bind_tags;
use crate::strategy::{CacheValue, Condition, Strategy, WrappedCall, lock_token, store_always};
use crate::tags::TagRegistry;

/// Fraction of the physical TTL used as the early window when none is given.
const DEFAULT_EARLY_RATIO: f64 = 0.5;

const DEFAULT_REFRESH_LOCK_TTL: Duration = Duration::from_secs(10);

/// Builder for [`EarlyCache`]
pub struct EarlyCacheBuilder<T, B, S = JsonSerializer> {
    backend: Arc<B>,
    signature: FnSignature,
    ttl: TtlSpec,
    early_ttl: Option<TtlSpec>,
    refresh_chance: f64,
    refresh_lock_ttl: TtlSpec,
    key: Option<String>,
    prefix: String,
    condition: Condition<T>,
    tags: Vec<String>,
    registry: Option<Arc<TagRegistry>>,
    sink: Arc<dyn DetectionSink>,
    serializer: S,
}

impl<T, B, S> EarlyCacheBuilder<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
{
    /// The early window: how long an entry counts as fresh before calls
    /// start triggering refreshes. Defaults to half the physical TTL. Must
    /// not be per-call.
    pub fn early_ttl(mut self, early_ttl: impl Into<TtlSpec>) -> Self {
        self.early_ttl = Some(early_ttl.into());
        self
    }

    /// Probability in `[0.0, 1.0]` that a call past the early window
    /// triggers the refresh. Defaults to 1.0; lower it to spread refresh
    /// load across a fleet.
    pub fn refresh_chance(mut self, chance: f64) -> Self {
        self.refresh_chance = chance;
        self
    }

    /// Lifetime of the per-key refresh lock.
    pub fn refresh_lock_ttl(mut self, ttl: impl Into<TtlSpec>) -> Self {
        self.refresh_lock_ttl = ttl.into();
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

    pub fn serializer<S2: Serializer>(self, serializer: S2) -> EarlyCacheBuilder<T, B, S2> {
        EarlyCacheBuilder {
            backend: self.backend,
            signature: self.signature,
            ttl: self.ttl,
            early_ttl: self.early_ttl,
            refresh_chance: self.refresh_chance,
            refresh_lock_ttl: self.refresh_lock_ttl,
            key: self.key,
            prefix: self.prefix,
            condition: self.condition,
            tags: self.tags,
            registry: self.registry,
            sink: self.sink,
            serializer,
        }
    }

    pub fn build(self) -> Result<EarlyCache<T, B, S>> {
        let template = KeyTemplate::derive(&self.signature, self.key.as_deref(), &self.prefix)?;
        if !self.ttl.is_per_call() {
            resolve_ttl_static(&self.ttl)?;
        }
        if let Some(early) = &self.early_ttl {
            resolve_ttl_static(early)?;
        }
        if !(0.0..=1.0).contains(&self.refresh_chance) {
            return Err(CacheError::Configuration(format!(
                "refresh chance {} outside [0.0, 1.0]",
                self.refresh_chance
            )));
        }
        let refresh_lock_ttl = resolve_ttl_static(&self.refresh_lock_ttl)?;
        let registry = bind_tags(&self.tags, self.registry, &template)?;
        Ok(EarlyCache {
            backend: self.backend,
            signature: self.signature,
            template,
            ttl: self.ttl,
            early_ttl: self.early_ttl,
            refresh_chance: self.refresh_chance,
            refresh_lock_ttl,
            condition: self.condition,
            registry,
            sink: self.sink,
            serializer: self.serializer,
            _value: PhantomData,
        })
    }
}

/// Early-refresh cache over a wrapped callable
pub struct EarlyCache<T, B, S = JsonSerializer> {
    backend: Arc<B>,
    signature: FnSignature,
    template: KeyTemplate,
    ttl: TtlSpec,
    early_ttl: Option<TtlSpec>,
    refresh_chance: f64,
    refresh_lock_ttl: Duration,
    condition: Condition<T>,
    registry: Option<Arc<TagRegistry>>,
    sink: Arc<dyn DetectionSink>,
    serializer: S,
    _value: PhantomData<fn() -> T>,
}

impl<T, B> EarlyCache<T, B>
where
    T: CacheValue,
    B: CacheBackend,
{
    pub fn builder(
        backend: Arc<B>,
        signature: FnSignature,
        ttl: impl Into<TtlSpec>,
    ) -> EarlyCacheBuilder<T, B> {
        EarlyCacheBuilder {
            backend,
            signature,
            ttl: ttl.into(),
            early_ttl: None,
            refresh_chance: 1.0,
            refresh_lock_ttl: TtlSpec::Fixed(DEFAULT_REFRESH_LOCK_TTL),
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

impl<T, B, S> EarlyCache<T, B, S>
where
    T: CacheValue,
    B: CacheBackend,
    S: Serializer,
{
    pub const NAME: &'static str = "early";

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
        let early_ttl = match &self.early_ttl {
            Some(spec) => resolve_ttl_static(spec)?.min(ttl),
            None => ttl.mul_f64(DEFAULT_EARLY_RATIO),
        };
        let entry = SoftEntry::new(value.clone(), early_ttl);
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

    fn spawn_refresh(&self, key: String, args: CallArgs, inner: WrappedCall<T>) {
        let strategy = self.clone();
        tokio::spawn(async move {
            let lock_key = format!("{key}:refresh");
            let token = lock_token();
            match strategy
                .backend
                .acquire_lock(&lock_key, &token, strategy.refresh_lock_ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => return, // another refresh is already running
                Err(err) => {
                    debug!(target: "polycache", key = %key, %err, "refresh lock unavailable");
                    return;
                }
            }

            match inner(args.clone()).await {
                Ok(result) => {
                    if (strategy.condition)(&result, &args, &key) {
                        if let Err(err) = strategy.store(&key, &args, &result).await {
                            warn!(target: "polycache", key = %key, %err, "background refresh store failed");
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "polycache", key = %key, %err, "background refresh failed");
                }
            }

            // The marker expires on its own if this release is missed.
            if let Err(err) = strategy.backend.release_lock(&lock_key, &token).await {
                debug!(target: "polycache", key = %key, %err, "refresh lock release failed");
            }
        });
    }

    async fn call(&self, args: CallArgs, inner: &WrappedCall<T>) -> Result<T> {
        let key = self.resolve_key(&args)?;

        if let Some(entry) = self.read(&key).await {
            if entry.is_fresh() {
                self.emit(&key, CallOutcome::Hit, self.ttl.static_duration(), &entry.value);
                return Ok(entry.value);
            }
            // Past the early window but physically live: serve the current
            // value, maybe kicking off a refresh first.
            if self.refresh_chance >= 1.0 || rand::random::<f64>() < self.refresh_chance {
                self.spawn_refresh(key.clone(), args.clone(), inner.clone());
                self.emit(&key, CallOutcome::Early, None, &entry.value);
            } else {
                self.emit(&key, CallOutcome::Stale, None, &entry.value);
            }
            return Ok(entry.value);
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

impl<T, B, S> Strategy<T> for EarlyCache<T, B, S>
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

impl<T, B, S: Clone> Clone for EarlyCache<T, B, S> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            signature: self.signature.clone(),
            template: self.template.clone(),
            ttl: self.ttl.clone(),
            early_ttl: self.early_ttl.clone(),
            refresh_chance: self.refresh_chance,
            refresh_lock_ttl: self.refresh_lock_ttl,
            condition: self.condition.clone(),
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            serializer: self.serializer.clone(),
            _value: PhantomData,
        }
    }
}
