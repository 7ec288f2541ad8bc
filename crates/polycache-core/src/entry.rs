//! Stored-entry envelope for pre-expiration strategies

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// What the soft and early strategies actually store: the payload together
/// with its logical expiration.
///
/// The physical TTL handed to the backend is always at least as long as the
/// logical window, so a logically stale value stays retrievable until the
/// backend evicts it. Wall-clock time is used deliberately: the moment an
/// entry goes stale must mean the same thing to every process reading it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftEntry<T> {
    /// Instant after which the value is logically stale.
    pub stale_at: SystemTime,
    /// The cached payload.
    pub value: T,
}

impl<T> SoftEntry<T> {
    /// Wrap a value that stays logically fresh for `soft_ttl` from now.
    pub fn new(value: T, soft_ttl: Duration) -> Self {
        Self {
            stale_at: SystemTime::now() + soft_ttl,
            value,
        }
    }

    /// True while the logical expiration lies in the future.
    pub fn is_fresh(&self) -> bool {
        self.stale_at > SystemTime::now()
    }

    /// Time left until the value goes logically stale, zero once it has.
    pub fn freshness_left(&self) -> Duration {
        self.stale_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_until_stale_at() {
        let entry = SoftEntry::new("v".to_string(), Duration::from_secs(60));
        assert!(entry.is_fresh());
        assert!(entry.freshness_left() > Duration::from_secs(58));
    }

    #[test]
    fn test_stale_after_window() {
        let entry = SoftEntry::new(7u64, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!entry.is_fresh());
        assert_eq!(entry.freshness_left(), Duration::ZERO);
    }

    #[test]
    fn test_envelope_round_trip() {
        let entry = SoftEntry::new(vec![1u32, 2, 3], Duration::from_secs(30));
        let bytes = serde_json::to_vec(&entry).unwrap();
        let back: SoftEntry<Vec<u32>> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, entry);
    }
}
