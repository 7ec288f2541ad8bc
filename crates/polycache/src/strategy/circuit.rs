//! Circuit breaker over a wrapped callable
//!
//! Counts matching failures inside a rolling window. At the threshold the
//! circuit opens and calls fail fast with [`CacheError::CircuitOpen`],
//! without invoking the wrapped function at all. After a cooldown the
//! circuit is half-open: a bounded number of trial calls pass through,
//! and the first success closes it while a failure reopens it with a
//! fresh cooldown.
//!
//! All state lives in backend keys under the resolved resource key, so
//! every process sharing the backend sees the same circuit. Backend errors
//! surface: a breaker that cannot read its own state must not guess.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use polycache_core::{
    CacheBackend, CacheError, CallArgs, FnSignature, KeyTemplate, Result, TtlSpec,
    resolve_ttl_static,
};

use crate::strategy::{FailurePredicate, Strategy, WrappedCall, any_computation_failure};

const DEFAULT_THRESHOLD: u32 = 5;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
const DEFAULT_HALF_OPEN_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_MAX_TRIALS: u32 = 3;

/// Observable circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Builder for [`CircuitBreaker`]
pub struct CircuitBreakerBuilder<B> {
    backend: Arc<B>,
    signature: FnSignature,
    threshold: u32,
    window: TtlSpec,
    cooldown: TtlSpec,
    half_open_window: TtlSpec,
    max_trials: u32,
    failures_match: FailurePredicate,
    key: Option<String>,
    prefix: String,
}

impl<B: CacheBackend> CircuitBreakerBuilder<B> {
    /// Matching failures within the window that open the circuit.
    pub fn threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Length of the failure-counting window.
    pub fn window(mut self, window: impl Into<TtlSpec>) -> Self {
        self.window = window.into();
        self
    }

    /// How long the circuit stays open before trial calls are admitted.
    pub fn cooldown(mut self, cooldown: impl Into<TtlSpec>) -> Self {
        self.cooldown = cooldown.into();
        self
    }

    /// How long the half-open phase lasts after the cooldown.
    pub fn half_open_window(mut self, window: impl Into<TtlSpec>) -> Self {
        self.half_open_window = window.into();
        self
    }

    /// Trial calls admitted while half-open; the rest fail fast.
    pub fn max_trials(mut self, max_trials: u32) -> Self {
        self.max_trials = max_trials;
        self
    }

    /// Which failures count against the threshold. Defaults to every
    /// computation failure.
    pub fn failures_match(mut self, predicate: FailurePredicate) -> Self {
        self.failures_match = predicate;
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

    pub fn build(self) -> Result<CircuitBreaker<B>> {
        let template = KeyTemplate::derive(&self.signature, self.key.as_deref(), &self.prefix)?;
        if self.threshold == 0 {
            return Err(CacheError::Configuration(
                "circuit threshold must be at least 1".to_string(),
            ));
        }
        Ok(CircuitBreaker {
            backend: self.backend,
            signature: self.signature,
            template,
            threshold: self.threshold,
            window: resolve_ttl_static(&self.window)?,
            cooldown: resolve_ttl_static(&self.cooldown)?,
            half_open_window: resolve_ttl_static(&self.half_open_window)?,
            max_trials: self.max_trials,
            failures_match: self.failures_match,
        })
    }
}

/// Count-based circuit breaker
///
/// State keys under the resolved resource key `k`:
/// - `k:open`: present while the circuit is open; expires with the cooldown
/// - `k:half`: present while trial calls are admitted
/// - `k:trials`: trial calls consumed in the current half-open phase
/// - `k:failures`: matching failures in the current window
pub struct CircuitBreaker<B> {
    backend: Arc<B>,
    signature: FnSignature,
    template: KeyTemplate,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    half_open_window: Duration,
    max_trials: u32,
    failures_match: FailurePredicate,
}

impl<B: CacheBackend> CircuitBreaker<B> {
    pub const NAME: &'static str = "circuit_breaker";

    pub fn builder(backend: Arc<B>, signature: FnSignature) -> CircuitBreakerBuilder<B> {
        CircuitBreakerBuilder {
            backend,
            signature,
            threshold: DEFAULT_THRESHOLD,
            window: TtlSpec::Fixed(DEFAULT_WINDOW),
            cooldown: TtlSpec::Fixed(DEFAULT_COOLDOWN),
            half_open_window: TtlSpec::Fixed(DEFAULT_HALF_OPEN_WINDOW),
            max_trials: DEFAULT_MAX_TRIALS,
            failures_match: any_computation_failure(),
            key: None,
            prefix: "circuit".to_string(),
        }
    }

    pub fn template(&self) -> &KeyTemplate {
        &self.template
    }

    fn resolve_key(&self, args: &CallArgs) -> Result<String> {
        let bound = self.signature.bind(args)?;
        self.template.resolve(&bound)
    }

    /// Current state of the circuit for one resource.
    pub async fn state(&self, args: &CallArgs) -> Result<CircuitState> {
        let key = self.resolve_key(args)?;
        if self.backend.exists(&format!("{key}:open")).await? {
            Ok(CircuitState::Open)
        } else if self.backend.exists(&format!("{key}:half")).await? {
            Ok(CircuitState::HalfOpen)
        } else {
            Ok(CircuitState::Closed)
        }
    }

    async fn trip(&self, key: &str) -> Result<()> {
        debug!(target: "polycache", resource = %key, "circuit opened");
        self.backend
            .set(
                &format!("{key}:open"),
                b"1".to_vec(),
                Some(self.cooldown),
                false,
            )
            .await?;
        // The half-open flag outlives the open flag by exactly the trial
        // window; once the open flag expires, its presence admits trials.
        self.backend
            .set(
                &format!("{key}:half"),
                b"1".to_vec(),
                Some(self.cooldown + self.half_open_window),
                false,
            )
            .await?;
        self.backend.delete(&format!("{key}:failures")).await?;
        Ok(())
    }

    async fn close(&self, key: &str) -> Result<()> {
        debug!(target: "polycache", resource = %key, "circuit closed");
        self.backend.delete(&format!("{key}:half")).await?;
        self.backend.delete(&format!("{key}:trials")).await?;
        self.backend.delete(&format!("{key}:failures")).await?;
        Ok(())
    }

    async fn call<T>(&self, args: CallArgs, inner: &WrappedCall<T>) -> Result<T>
    where
        T: Send + 'static,
    {
        let key = self.resolve_key(&args)?;

        if self.backend.exists(&format!("{key}:open")).await? {
            return Err(CacheError::CircuitOpen { resource: key });
        }

        let half_open = self.backend.exists(&format!("{key}:half")).await?;
        if half_open {
            let trials = self
                .backend
                .incr(&format!("{key}:trials"), Some(self.half_open_window))
                .await?;
            if trials > i64::from(self.max_trials) {
                return Err(CacheError::CircuitOpen { resource: key });
            }
        }

        match inner(args).await {
            Ok(value) => {
                if half_open {
                    self.close(&key).await?;
                }
                Ok(value)
            }
            Err(err) if (self.failures_match)(&err) => {
                if half_open {
                    self.backend.delete(&format!("{key}:trials")).await?;
                    self.trip(&key).await?;
                } else {
                    let failures = self
                        .backend
                        .incr(&format!("{key}:failures"), Some(self.window))
                        .await?;
                    if failures >= i64::from(self.threshold) {
                        self.trip(&key).await?;
                    }
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

impl<T, B> Strategy<T> for CircuitBreaker<B>
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

impl<B> Clone for CircuitBreaker<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            signature: self.signature.clone(),
            template: self.template.clone(),
            threshold: self.threshold,
            window: self.window,
            cooldown: self.cooldown,
            half_open_window: self.half_open_window,
            max_trials: self.max_trials,
            failures_match: self.failures_match.clone(),
        }
    }
}
