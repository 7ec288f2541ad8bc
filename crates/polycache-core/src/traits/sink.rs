//! Detection sink for per-call outcome reporting
//!
//! Every caching strategy reports what each decorated call did: which key it
//! resolved, which template produced that key, and whether the caller was
//! served from cache, from a stale value, from another caller's in-flight
//! computation, or by recomputing. A sink receives one event per call and
//! decides what to do with it; the strategies never look at it again.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;

/// How one decorated call was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOutcome {
    /// Served a fresh cached value
    Hit,
    /// No usable cached value; the wrapped function ran
    Miss,
    /// Served within the soft (pre-expiration) window
    Soft,
    /// Served the current value while a background refresh was triggered
    Early,
    /// Served a logically stale value
    Stale,
    /// Served the result another caller computed under the key lock
    Locked,
}

impl CallOutcome {
    /// Get outcome as string label
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Hit => "hit",
            CallOutcome::Miss => "miss",
            CallOutcome::Soft => "soft",
            CallOutcome::Early => "early",
            CallOutcome::Stale => "stale",
            CallOutcome::Locked => "locked",
        }
    }

    /// True when the wrapped function did not run on the caller's path.
    pub fn served_from_cache(&self) -> bool {
        !matches!(self, CallOutcome::Miss)
    }
}

/// One decorated call, as observed by the strategy that served it
#[derive(Debug, Clone)]
pub struct CallEvent {
    /// The concrete resolved cache key
    pub key: String,
    /// The source template the key was resolved from
    pub template: String,
    /// Name of the reporting strategy
    pub strategy: &'static str,
    /// How the call was served
    pub outcome: CallOutcome,
    /// TTL associated with the value, where one was known
    pub ttl: Option<Duration>,
    /// The served value; captured only for sinks that ask for values
    pub value: Option<serde_json::Value>,
}

/// Trait for detection sinks
///
/// Implement this to route call events into your observability system. The
/// `record` call sits on the hot path of every decorated call, so
/// implementations should hand off rather than block.
pub trait DetectionSink: Send + Sync + 'static {
    /// Record one decorated call
    fn record(&self, event: CallEvent);

    /// Whether events should carry the served value
    ///
    /// Capturing a value costs a serialization per call, so sinks must opt
    /// in. The default is off.
    fn wants_values(&self) -> bool {
        false
    }
}

/// Capture a value for an event, but only when the sink asked for values.
pub fn capture_value<T: Serialize>(
    sink: &dyn DetectionSink,
    value: &T,
) -> Option<serde_json::Value> {
    if sink.wants_values() {
        serde_json::to_value(value).ok()
    } else {
        None
    }
}

/// No-op sink (default)
///
/// Zero overhead when detection is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl DetectionSink for NoopSink {
    #[inline]
    fn record(&self, _event: CallEvent) {}
}

/// Sink that buffers events in memory
///
/// Opts into value capture. Meant for tests and for interactive inspection
/// of what a strategy stack is doing.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CallEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, oldest first.
    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().clone()
    }

    /// The most recent event, if any.
    pub fn last(&self) -> Option<CallEvent> {
        self.events.lock().last().cloned()
    }

    /// Just the outcomes, in recording order.
    pub fn outcomes(&self) -> Vec<CallOutcome> {
        self.events.lock().iter().map(|e| e.outcome).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl DetectionSink for MemorySink {
    fn record(&self, event: CallEvent) {
        self.events.lock().push(event);
    }

    fn wants_values(&self) -> bool {
        true
    }
}

/// Sink that logs events through `tracing`
///
/// Enable with the `tracing` feature.
#[cfg(feature = "tracing")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[cfg(feature = "tracing")]
impl DetectionSink for TracingSink {
    fn record(&self, event: CallEvent) {
        tracing::debug!(
            target: "polycache",
            key = %event.key,
            template = %event.template,
            strategy = event.strategy,
            outcome = event.outcome.as_str(),
            "cache call"
        );
    }
}

/// Sink emitting counters through the `metrics` crate
///
/// Integrates with Prometheus, StatsD, and other exporters via the `metrics`
/// ecosystem. Enable with the `metrics` feature.
///
/// # Example
/// ```ignore
/// use polycache_core::MetricsSink;
///
/// // Set up a metrics recorder (e.g., prometheus_exporter)
/// // metrics::set_global_recorder(recorder);
///
/// let sink = MetricsSink::new("polycache");
/// // Emits: polycache_calls_total{strategy, outcome}
/// ```
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSink {
    prefix: String,
}

#[cfg(feature = "metrics")]
impl MetricsSink {
    /// Create a new sink with the given metric name prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn metric_name(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }
}

#[cfg(feature = "metrics")]
impl DetectionSink for MetricsSink {
    fn record(&self, event: CallEvent) {
        metrics::counter!(
            self.metric_name("calls_total"),
            "strategy" => event.strategy,
            "outcome" => event.outcome.as_str()
        )
        .increment(1);
    }
}
