//! Cache backend trait
//!
//! The capability set every storage backend must provide. Strategies are
//! written against this trait alone, so any store that can honor these
//! contracts (an in-process map, a remote key-value server) can sit under
//! any strategy unchanged.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Core trait for all cache storage backends
///
/// Values are opaque byte payloads; expirations are durations from the time
/// of the write. All operations are failable so that callers can decide per
/// call path whether a backend failure is fatal or degradable.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Get a value
    ///
    /// Returns `None` if the key doesn't exist or has expired. Expired keys
    /// must be indistinguishable from absent ones.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value, with an optional expiration
    ///
    /// With `if_absent` set, the write only happens when the key holds no
    /// live value; returns whether the write happened.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Option<Duration>,
        if_absent: bool,
    ) -> Result<bool>;

    /// Get multiple keys at once
    ///
    /// Returns one slot per input key, in input order.
    async fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Atomically increment a counter, creating it at 1 when absent
    ///
    /// `expire` applies only when the increment creates the key, which gives
    /// counters fixed-window semantics: the window is pinned at first use
    /// and later increments never extend it. Returns the new value.
    async fn incr(&self, key: &str, expire: Option<Duration>) -> Result<i64>;

    /// Delete a key
    ///
    /// Returns `true` if the key held a live value.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key matching a wildcard pattern (`*` matches any run of
    /// characters, including an empty one)
    ///
    /// Returns the number of keys deleted.
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;

    /// Try to acquire a lock marker
    ///
    /// Succeeds only when the key holds no live marker; the marker stores
    /// `token` and always expires after `expire`, so a crashed holder cannot
    /// leave the key locked forever.
    async fn acquire_lock(&self, key: &str, token: &str, expire: Duration) -> Result<bool>;

    /// Release a lock marker, but only when it still stores `token`
    ///
    /// Returns whether a marker was released. A mismatched token means the
    /// marker expired and someone else holds the lock now; releasing theirs
    /// would be a correctness bug, so the call is a no-op.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool>;

    /// Time until a key expires
    ///
    /// `None` when the key is absent or has no expiration.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Check whether a key holds a live value
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Drop every key
    async fn clear(&self) -> Result<()>;
}

/// Extended trait for backends with bit-level storage
///
/// Probabilistic strategies store filters as plain byte strings and address
/// individual bits within them. Backends without native bit operations can
/// emulate them over `get`/`set`; the in-process backend does.
#[async_trait]
pub trait BitsBackend: CacheBackend {
    /// Set the given bit positions to 1, growing the value as needed
    ///
    /// `expire` applies only when the write creates the key, matching the
    /// fixed-window rule for counters.
    async fn set_bits(&self, key: &str, positions: &[u64], expire: Option<Duration>) -> Result<()>;

    /// Read the given bit positions
    ///
    /// Positions beyond the stored value, or on an absent key, read as 0.
    async fn get_bits(&self, key: &str, positions: &[u64]) -> Result<Vec<bool>>;
}
