//! TTL specifications and resolution
//!
//! A [`TtlSpec`] describes how long a stored value lives: a fixed duration,
//! a duration string such as `"1h30m"`, or a per-call function of the call
//! context. Specs resolve to a concrete [`Duration`] only when a value is
//! about to be stored, and resolution has no side effects: resolving the
//! same spec against the same context always yields the same duration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::key::CallArgs;

/// Context handed to per-call TTL functions.
pub struct TtlContext<'a> {
    /// Arguments of the call whose result is being stored.
    pub args: &'a CallArgs,
    /// The computed result, present when resolution happens at storage time.
    pub result: Option<&'a serde_json::Value>,
}

/// A per-call TTL function.
pub type TtlFn = dyn Fn(&TtlContext<'_>) -> TtlSpec + Send + Sync;

/// How long a stored value should live.
#[derive(Clone)]
pub enum TtlSpec {
    /// A fixed duration.
    Fixed(Duration),
    /// A duration string: bare seconds (`"90"`) or unit pairs (`"10m"`,
    /// `"1h30m"`, `"2d"`).
    Text(String),
    /// Computed per call from the arguments and, where available, the
    /// result.
    PerCall(Arc<TtlFn>),
}

impl TtlSpec {
    /// Build a per-call spec from a closure.
    pub fn per_call<F>(f: F) -> Self
    where
        F: Fn(&TtlContext<'_>) -> TtlSpec + Send + Sync + 'static,
    {
        TtlSpec::PerCall(Arc::new(f))
    }

    /// The duration this spec resolves to without any call context, when it
    /// has one. Used for reporting on paths where no resolution happens.
    pub fn static_duration(&self) -> Option<Duration> {
        match self {
            TtlSpec::Fixed(duration) => Some(*duration),
            TtlSpec::Text(text) => parse_duration(text).ok(),
            TtlSpec::PerCall(_) => None,
        }
    }

    pub fn is_per_call(&self) -> bool {
        matches!(self, TtlSpec::PerCall(_))
    }
}

impl fmt::Debug for TtlSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TtlSpec::Fixed(duration) => f.debug_tuple("Fixed").field(duration).finish(),
            TtlSpec::Text(text) => f.debug_tuple("Text").field(text).finish(),
            TtlSpec::PerCall(_) => f.write_str("PerCall(..)"),
        }
    }
}

impl From<Duration> for TtlSpec {
    fn from(duration: Duration) -> Self {
        TtlSpec::Fixed(duration)
    }
}

impl From<&str> for TtlSpec {
    fn from(text: &str) -> Self {
        TtlSpec::Text(text.to_string())
    }
}

impl From<String> for TtlSpec {
    fn from(text: String) -> Self {
        TtlSpec::Text(text)
    }
}

impl From<u64> for TtlSpec {
    fn from(seconds: u64) -> Self {
        TtlSpec::Fixed(Duration::from_secs(seconds))
    }
}

/// Resolve a spec that must not be call-dependent: lock lifetimes, rate and
/// circuit windows, and similar registration-time durations.
pub fn resolve_ttl_static(spec: &TtlSpec) -> Result<Duration> {
    match spec {
        TtlSpec::Fixed(duration) => Ok(*duration),
        TtlSpec::Text(text) => parse_duration(text),
        TtlSpec::PerCall(_) => Err(CacheError::Configuration(
            "a per-call ttl is not allowed here".to_string(),
        )),
    }
}

/// Resolve a spec against one call. Per-call functions are invoked with the
/// context and their return value resolved in turn; a function returning
/// another function is a configuration error rather than a recursion.
pub fn resolve_ttl(spec: &TtlSpec, ctx: &TtlContext<'_>) -> Result<Duration> {
    match spec {
        TtlSpec::PerCall(f) => match f(ctx) {
            TtlSpec::PerCall(_) => Err(CacheError::Configuration(
                "per-call ttl resolved to another per-call ttl".to_string(),
            )),
            inner => resolve_ttl_static(&inner),
        },
        other => resolve_ttl_static(other),
    }
}

/// Parse a duration string: bare seconds or concatenated `<count><unit>`
/// pairs with units `s`, `m`, `h` and `d`.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return Err(malformed(text));
    }
    if let Ok(seconds) = text.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut saw_pair = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Err(malformed(text));
        }
        let count: u64 = digits.parse().map_err(|_| malformed(text))?;
        let unit: u64 = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(malformed(text)),
        };
        total = count
            .checked_mul(unit)
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| malformed(text))?;
        digits.clear();
        saw_pair = true;
    }
    if !digits.is_empty() || !saw_pair {
        return Err(malformed(text));
    }
    Ok(Duration::from_secs(total))
}

fn malformed(text: &str) -> CacheError {
    CacheError::Configuration(format!("malformed duration: {text:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(
            parse_duration("1d2h3m4s").unwrap(),
            Duration::from_secs(93_784)
        );
    }

    #[test]
    fn test_parse_duration_rejects_malformed() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("m10").is_err());
        assert!(parse_duration("1h 30m").is_err());
    }

    #[test]
    fn test_static_resolution() {
        assert_eq!(
            resolve_ttl_static(&TtlSpec::from(Duration::from_secs(5))).unwrap(),
            Duration::from_secs(5)
        );
        assert_eq!(
            resolve_ttl_static(&"10m".into()).unwrap(),
            Duration::from_secs(600)
        );
        let per_call = TtlSpec::per_call(|_| TtlSpec::from(1u64));
        assert!(resolve_ttl_static(&per_call).is_err());
    }

    #[test]
    fn test_per_call_resolution() {
        let spec = TtlSpec::per_call(|ctx| {
            if ctx.args.named_value("premium") == Some("true") {
                "1h".into()
            } else {
                "1m".into()
            }
        });
        let premium = CallArgs::new().named("premium", "true");
        let free = CallArgs::new().named("premium", "false");

        let ttl = resolve_ttl(
            &spec,
            &TtlContext {
                args: &premium,
                result: None,
            },
        )
        .unwrap();
        assert_eq!(ttl, Duration::from_secs(3600));

        let ttl = resolve_ttl(
            &spec,
            &TtlContext {
                args: &free,
                result: None,
            },
        )
        .unwrap();
        assert_eq!(ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_per_call_sees_result() {
        let spec = TtlSpec::per_call(|ctx| match ctx.result {
            Some(serde_json::Value::Null) => TtlSpec::from(Duration::from_secs(1)),
            _ => TtlSpec::from(Duration::from_secs(300)),
        });
        let args = CallArgs::new();
        let hit = serde_json::json!({"id": 1});

        let ttl = resolve_ttl(
            &spec,
            &TtlContext {
                args: &args,
                result: Some(&hit),
            },
        )
        .unwrap();
        assert_eq!(ttl, Duration::from_secs(300));

        let ttl = resolve_ttl(
            &spec,
            &TtlContext {
                args: &args,
                result: Some(&serde_json::Value::Null),
            },
        )
        .unwrap();
        assert_eq!(ttl, Duration::from_secs(1));
    }

    #[test]
    fn test_per_call_cannot_nest() {
        let spec = TtlSpec::per_call(|_| TtlSpec::per_call(|_| TtlSpec::from(1u64)));
        let args = CallArgs::new();
        assert!(
            resolve_ttl(
                &spec,
                &TtlContext {
                    args: &args,
                    result: None
                }
            )
            .is_err()
        );
    }

    #[test]
    fn test_resolution_is_pure() {
        let spec = TtlSpec::from("45s");
        let args = CallArgs::new().positional(1);
        let ctx = TtlContext {
            args: &args,
            result: None,
        };
        let first = resolve_ttl(&spec, &ctx).unwrap();
        let second = resolve_ttl(&spec, &ctx).unwrap();
        assert_eq!(first, second);
    }
}
