//! Bloom-filter gate for existence-style functions
//!
//! A probabilistic filter answering "definitely not" cheaply. The gate wraps
//! a boolean function; when the filter rules the member out, the call
//! returns `false` without running the wrapped function. False positives
//! pass through to the real computation, false negatives cannot happen for
//! members recorded through the gate.
//!
//! Filter bits live in the backend, addressed through [`BitsBackend`], so
//! every process sharing the backend shares one filter. [`DualBloomGate`]
//! adds aging: writes land in a generation keyed by coarse wall-clock time
//! and generations expire, so members stop matching once they go unrecorded
//! for two full periods.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use polycache_core::{
    BitsBackend, CacheError, CallArgs, CallEvent, CallOutcome, DetectionSink, FnSignature,
    KeyTemplate, NoopSink, Result, capture_value,
};

use crate::strategy::{Strategy, WrappedCall};

/// Compute optimal filter parameters for a capacity and false positive rate
///
/// m = -n * ln(p) / (ln(2)^2), k = (m/n) * ln(2)
fn optimal_params(capacity: usize, false_positive_rate: f64) -> (u64, u32) {
    let ln2 = std::f64::consts::LN_2;
    let ln2_sq = ln2 * ln2;

    let num_bits = (-(capacity as f64) * false_positive_rate.ln() / ln2_sq).ceil();
    let num_bits = (num_bits.max(64.0)) as u64;

    let num_hashes = ((num_bits as f64 / capacity as f64) * ln2).ceil();
    let num_hashes = num_hashes.clamp(1.0, 16.0) as u32;

    (num_bits, num_hashes)
}

/// Double hashing: h(i) = h1 + i * h2
fn bit_positions(member: &str, num_bits: u64, num_hashes: u32) -> Vec<u64> {
    let mut hasher1 = std::collections::hash_map::DefaultHasher::new();
    member.hash(&mut hasher1);
    let h1 = hasher1.finish();

    let mut hasher2 = std::collections::hash_map::DefaultHasher::new();
    (member, 0x9e37_79b9_7f4a_7c15_u64).hash(&mut hasher2);
    let h2 = hasher2.finish();

    (0..u64::from(num_hashes))
        .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
        .collect()
}

fn validate_params(capacity: usize, false_positive_rate: f64) -> Result<()> {
    if capacity == 0 {
        return Err(CacheError::Configuration(
            "bloom capacity must be at least 1".to_string(),
        ));
    }
    if !(0.0..1.0).contains(&false_positive_rate) || false_positive_rate == 0.0 {
        return Err(CacheError::Configuration(format!(
            "false positive rate {false_positive_rate} outside (0.0, 1.0)"
        )));
    }
    Ok(())
}

/// Builder for [`BloomGate`]
pub struct BloomGateBuilder<B> {
    backend: Arc<B>,
    signature: FnSignature,
    capacity: usize,
    false_positive_rate: f64,
    key: Option<String>,
    prefix: String,
    sink: Arc<dyn DetectionSink>,
}

impl<B: BitsBackend> BloomGateBuilder<B> {
    pub fn key(mut self, template: impl Into<String>) -> Self {
        self.key = Some(template.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Result<BloomGate<B>> {
        validate_params(self.capacity, self.false_positive_rate)?;
        let template = KeyTemplate::derive(&self.signature, self.key.as_deref(), &self.prefix)?;
        let (num_bits, num_hashes) = optimal_params(self.capacity, self.false_positive_rate);
        let filter_key = filter_key(&self.prefix, self.signature.name());
        Ok(BloomGate {
            backend: self.backend,
            signature: self.signature,
            template,
            filter_key,
            num_bits,
            num_hashes,
            sink: self.sink,
        })
    }
}

fn filter_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        format!("{name}:filter")
    } else {
        format!("{prefix}:{name}:filter")
    }
}

/// Bloom-filter gate over a boolean callable
pub struct BloomGate<B> {
    backend: Arc<B>,
    signature: FnSignature,
    template: KeyTemplate,
    filter_key: String,
    num_bits: u64,
    num_hashes: u32,
    sink: Arc<dyn DetectionSink>,
}

impl<B: BitsBackend> BloomGate<B> {
    pub const NAME: &'static str = "bloom";

    /// Gate sized for `capacity` expected members at the given false
    /// positive rate.
    pub fn builder(
        backend: Arc<B>,
        signature: FnSignature,
        capacity: usize,
        false_positive_rate: f64,
    ) -> BloomGateBuilder<B> {
        BloomGateBuilder {
            backend,
            signature,
            capacity,
            false_positive_rate,
            key: None,
            prefix: "bloom".to_string(),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    fn resolve_member(&self, args: &CallArgs) -> Result<String> {
        let bound = self.signature.bind(args)?;
        self.template.resolve(&bound)
    }

    fn emit(&self, member: &str, outcome: CallOutcome, value: bool) {
        self.sink.record(CallEvent {
            key: member.to_string(),
            template: self.template.source().to_string(),
            strategy: Self::NAME,
            outcome,
            ttl: None,
            value: capture_value(self.sink.as_ref(), &value),
        });
    }

    /// Record a positive member, so later calls can match it.
    async fn record(&self, member: &str) -> Result<()> {
        let positions = bit_positions(member, self.num_bits, self.num_hashes);
        self.backend.set_bits(&self.filter_key, &positions, None).await
    }

    /// Run the wrapped function and record a positive result. Used to
    /// pre-populate the filter before the gate starts short-circuiting.
    pub async fn warm(&self, args: CallArgs, inner: &WrappedCall<bool>) -> Result<bool> {
        let member = self.resolve_member(&args)?;
        let result = inner(args).await?;
        if result {
            self.record(&member).await?;
        }
        Ok(result)
    }

    async fn call(&self, args: CallArgs, inner: &WrappedCall<bool>) -> Result<bool> {
        let member = self.resolve_member(&args)?;
        let positions = bit_positions(member.as_str(), self.num_bits, self.num_hashes);

        // A filter that cannot be read only loses its short-circuit; the
        // wrapped function still gives the right answer.
        match self.backend.get_bits(&self.filter_key, &positions).await {
            Ok(bits) if !bits.iter().all(|&b| b) => {
                self.emit(&member, CallOutcome::Hit, false);
                return Ok(false);
            }
            Ok(_) => {}
            Err(err) => {
                debug!(target: "polycache", member = %member, %err, "filter read failed, passing through");
            }
        }

        let result = inner(args).await?;
        if result {
            if let Err(err) = self.record(&member).await {
                debug!(target: "polycache", member = %member, %err, "filter write failed");
            }
        }
        self.emit(&member, CallOutcome::Miss, result);
        Ok(result)
    }
}

impl<B: BitsBackend> Strategy<bool> for BloomGate<B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn wrap(&self, inner: WrappedCall<bool>) -> WrappedCall<bool> {
        let strategy = self.clone();
        Arc::new(move |args| {
            let strategy = strategy.clone();
            let inner = inner.clone();
            Box::pin(async move { strategy.call(args, &inner).await })
        })
    }
}

impl<B> Clone for BloomGate<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            signature: self.signature.clone(),
            template: self.template.clone(),
            filter_key: self.filter_key.clone(),
            num_bits: self.num_bits,
            num_hashes: self.num_hashes,
            sink: self.sink.clone(),
        }
    }
}

/// Builder for [`DualBloomGate`]
pub struct DualBloomGateBuilder<B> {
    backend: Arc<B>,
    signature: FnSignature,
    capacity: usize,
    false_positive_rate: f64,
    period: Duration,
    key: Option<String>,
    prefix: String,
    sink: Arc<dyn DetectionSink>,
}

impl<B: BitsBackend> DualBloomGateBuilder<B> {
    pub fn key(mut self, template: impl Into<String>) -> Self {
        self.key = Some(template.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Result<DualBloomGate<B>> {
        validate_params(self.capacity, self.false_positive_rate)?;
        if self.period.is_zero() {
            return Err(CacheError::Configuration(
                "rotation period must be non-zero".to_string(),
            ));
        }
        let template = KeyTemplate::derive(&self.signature, self.key.as_deref(), &self.prefix)?;
        let (num_bits, num_hashes) = optimal_params(self.capacity, self.false_positive_rate);
        let filter_key = filter_key(&self.prefix, self.signature.name());
        Ok(DualBloomGate {
            backend: self.backend,
            signature: self.signature,
            template,
            filter_key,
            num_bits,
            num_hashes,
            period: self.period,
            sink: self.sink,
        })
    }
}

/// Time-rotated bloom gate
///
/// Two filter generations alternate on a wall-clock schedule. Writes go to
/// the current generation; reads consult both, so a member recorded late in
/// one generation stays matchable through the whole next one. Each
/// generation expires two periods after its first write, which is what ages
/// members out.
pub struct DualBloomGate<B> {
    backend: Arc<B>,
    signature: FnSignature,
    template: KeyTemplate,
    filter_key: String,
    num_bits: u64,
    num_hashes: u32,
    period: Duration,
    sink: Arc<dyn DetectionSink>,
}

impl<B: BitsBackend> DualBloomGate<B> {
    pub const NAME: &'static str = "dual_bloom";

    pub fn builder(
        backend: Arc<B>,
        signature: FnSignature,
        capacity: usize,
        false_positive_rate: f64,
        period: Duration,
    ) -> DualBloomGateBuilder<B> {
        DualBloomGateBuilder {
            backend,
            signature,
            capacity,
            false_positive_rate,
            period,
            key: None,
            prefix: "bloom".to_string(),
            sink: Arc::new(NoopSink),
        }
    }

    fn generation(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        ((now / self.period.as_millis().max(1)) % 2) as u64
    }

    fn generation_key(&self, generation: u64) -> String {
        format!("{}:{generation}", self.filter_key)
    }

    fn resolve_member(&self, args: &CallArgs) -> Result<String> {
        let bound = self.signature.bind(args)?;
        self.template.resolve(&bound)
    }

    fn emit(&self, member: &str, outcome: CallOutcome, value: bool) {
        self.sink.record(CallEvent {
            key: member.to_string(),
            template: self.template.source().to_string(),
            strategy: Self::NAME,
            outcome,
            ttl: None,
            value: capture_value(self.sink.as_ref(), &value),
        });
    }

    async fn record(&self, member: &str) -> Result<()> {
        let positions = bit_positions(member, self.num_bits, self.num_hashes);
        let key = self.generation_key(self.generation());
        self.backend
            .set_bits(&key, &positions, Some(self.period * 2))
            .await
    }

    async fn matches(&self, member: &str) -> Result<bool> {
        let positions = bit_positions(member, self.num_bits, self.num_hashes);
        for generation in [0u64, 1] {
            let bits = self
                .backend
                .get_bits(&self.generation_key(generation), &positions)
                .await?;
            if bits.iter().all(|&b| b) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn warm(&self, args: CallArgs, inner: &WrappedCall<bool>) -> Result<bool> {
        let member = self.resolve_member(&args)?;
        let result = inner(args).await?;
        if result {
            self.record(&member).await?;
        }
        Ok(result)
    }

    async fn call(&self, args: CallArgs, inner: &WrappedCall<bool>) -> Result<bool> {
        let member = self.resolve_member(&args)?;

        match self.matches(&member).await {
            Ok(false) => {
                self.emit(&member, CallOutcome::Hit, false);
                return Ok(false);
            }
            Ok(true) => {}
            Err(err) => {
                debug!(target: "polycache", member = %member, %err, "filter read failed, passing through");
            }
        }

        let result = inner(args).await?;
        if result {
            if let Err(err) = self.record(&member).await {
                debug!(target: "polycache", member = %member, %err, "filter write failed");
            }
        }
        self.emit(&member, CallOutcome::Miss, result);
        Ok(result)
    }
}

impl<B: BitsBackend> Strategy<bool> for DualBloomGate<B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn wrap(&self, inner: WrappedCall<bool>) -> WrappedCall<bool> {
        let strategy = self.clone();
        Arc::new(move |args| {
            let strategy = strategy.clone();
            let inner = inner.clone();
            Box::pin(async move { strategy.call(args, &inner).await })
        })
    }
}

impl<B> Clone for DualBloomGate<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            signature: self.signature.clone(),
            template: self.template.clone(),
            filter_key: self.filter_key.clone(),
            num_bits: self.num_bits,
            num_hashes: self.num_hashes,
            period: self.period,
            sink: self.sink.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimal_params() {
        let (bits, hashes) = optimal_params(1000, 0.01);
        // Textbook values for n=1000, p=0.01: m ≈ 9586, k ≈ 7.
        assert!((9000..10_500).contains(&bits));
        assert_eq!(hashes, 7);

        let (bits, _) = optimal_params(1, 0.5);
        assert!(bits >= 64);
    }

    #[test]
    fn test_bit_positions_deterministic() {
        let a = bit_positions("member:1", 1024, 7);
        let b = bit_positions("member:1", 1024, 7);
        let c = bit_positions("member:2", 1024, 7);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 7);
        assert!(a.iter().all(|&p| p < 1024));
    }

    #[test]
    fn test_param_validation() {
        assert!(validate_params(0, 0.01).is_err());
        assert!(validate_params(100, 0.0).is_err());
        assert!(validate_params(100, 1.0).is_err());
        assert!(validate_params(100, 0.01).is_ok());
    }

    #[test]
    fn test_filter_key() {
        assert_eq!(filter_key("bloom", "exists"), "bloom:exists:filter");
        assert_eq!(filter_key("", "exists"), "exists:filter");
    }
}
