//! In-memory cache backend using DashMap
//!
//! The reference implementation of the backend capability set. Atomic
//! semantics (set-if-absent, counters, lock markers) are provided through
//! `DashMap`'s entry API, which holds the shard lock for the duration of the
//! check-and-write.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use polycache_core::{BitsBackend, CacheBackend, CacheError, Result};

/// Configuration for the memory backend
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum number of entries (0 = unlimited)
    pub max_entries: usize,
    /// Sweep expired entries every this many writes (0 = never)
    pub sweep_every: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 0,
            sweep_every: 256,
        }
    }
}

impl MemoryConfig {
    /// Create config with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            max_entries: capacity,
            ..Default::default()
        }
    }

    /// Create config with unlimited capacity
    pub fn unlimited() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
struct Stored {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Stored {
    fn new(data: Vec<u8>, expire: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: expire.map(|d| Instant::now() + d),
        }
    }

    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

/// In-memory cache backend
///
/// Expired entries are indistinguishable from absent ones on every read
/// path; physical removal happens lazily, on read, and in periodic sweeps
/// driven by write volume. Cloning creates a new handle to the SAME
/// underlying store.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<DashMap<String, Stored>>,
    writes: Arc<AtomicU64>,
    config: MemoryConfig,
}

impl MemoryBackend {
    /// Create a new memory backend
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            writes: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(MemoryConfig::default())
    }

    /// Number of physically present entries, live or not
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remove every expired entry and return how many were dropped
    pub fn sweep(&self) -> usize {
        let before = self.data.len();
        self.data.retain(|_, stored| stored.live());
        before.saturating_sub(self.data.len())
    }

    fn after_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.sweep_every > 0 && writes % self.config.sweep_every == 0 {
            self.sweep();
        }
        self.maybe_evict();
    }

    /// Evict entries if over capacity
    fn maybe_evict(&self) {
        if self.config.max_entries == 0 || self.data.len() <= self.config.max_entries {
            return;
        }

        // Expired entries go first; only then live ones, in arbitrary order.
        self.sweep();
        let excess = self.data.len().saturating_sub(self.config.max_entries);
        if excess == 0 {
            return;
        }
        let keys_to_remove: Vec<String> = self
            .data
            .iter()
            .take(excess)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys_to_remove {
            self.data.remove(&key);
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.data.get(key) {
            Some(stored) if stored.live() => Ok(Some(stored.data.clone())),
            Some(stored) => {
                drop(stored);
                self.data.remove_if(key, |_, s| !s.live());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        expire: Option<Duration>,
        if_absent: bool,
    ) -> Result<bool> {
        let stored = Stored::new(value, expire);
        let written = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if if_absent && occupied.get().live() {
                    false
                } else {
                    occupied.insert(stored);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                true
            }
        };
        self.after_write();
        Ok(written)
    }

    async fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await?);
        }
        Ok(results)
    }

    async fn incr(&self, key: &str, expire: Option<Duration>) -> Result<i64> {
        let value = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    let current = parse_counter(key, &occupied.get().data)?;
                    let next = current + 1;
                    occupied.get_mut().data = next.to_string().into_bytes();
                    next
                } else {
                    // Window elapsed: the counter restarts and the expiry
                    // is pinned anew.
                    occupied.insert(Stored::new(b"1".to_vec(), expire));
                    1
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Stored::new(b"1".to_vec(), expire));
                1
            }
        };
        self.after_write();
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, stored)| stored.live()))
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        // Collect first: removing while iterating would deadlock on the
        // shard locks.
        let keys: Vec<String> = self
            .data
            .iter()
            .filter(|entry| entry.value().live() && wildcard_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        let mut count = 0;
        for key in keys {
            if self.data.remove(&key).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn acquire_lock(&self, key: &str, token: &str, expire: Duration) -> Result<bool> {
        let marker = Stored::new(token.as_bytes().to_vec(), Some(expire));
        let acquired = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    false
                } else {
                    occupied.insert(marker);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(marker);
                true
            }
        };
        self.after_write();
        Ok(acquired)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        Ok(self
            .data
            .remove_if(key, |_, stored| {
                stored.live() && stored.data == token.as_bytes()
            })
            .is_some())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        match self.data.get(key) {
            Some(stored) if stored.live() => Ok(stored
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now()))),
            _ => Ok(None),
        }
    }

    async fn clear(&self) -> Result<()> {
        self.data.clear();
        Ok(())
    }
}

#[async_trait]
impl BitsBackend for MemoryBackend {
    async fn set_bits(&self, key: &str, positions: &[u64], expire: Option<Duration>) -> Result<()> {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    set_bit_positions(&mut occupied.get_mut().data, positions);
                } else {
                    let mut data = Vec::new();
                    set_bit_positions(&mut data, positions);
                    occupied.insert(Stored::new(data, expire));
                }
            }
            Entry::Vacant(vacant) => {
                let mut data = Vec::new();
                set_bit_positions(&mut data, positions);
                vacant.insert(Stored::new(data, expire));
            }
        }
        self.after_write();
        Ok(())
    }

    async fn get_bits(&self, key: &str, positions: &[u64]) -> Result<Vec<bool>> {
        match self.data.get(key) {
            Some(stored) if stored.live() => {
                let data = &stored.data;
                Ok(positions
                    .iter()
                    .map(|&pos| {
                        let byte = (pos / 8) as usize;
                        byte < data.len() && data[byte] & (1 << (pos % 8)) != 0
                    })
                    .collect())
            }
            _ => Ok(vec![false; positions.len()]),
        }
    }
}

fn set_bit_positions(data: &mut Vec<u8>, positions: &[u64]) {
    for &pos in positions {
        let byte = (pos / 8) as usize;
        if byte >= data.len() {
            data.resize(byte + 1, 0);
        }
        data[byte] |= 1 << (pos % 8);
    }
}

fn parse_counter(key: &str, data: &[u8]) -> Result<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| {
            CacheError::BackendUnavailable(format!("key {key:?} does not hold a counter"))
        })
}

/// Match `text` against a pattern where `*` matches any run of characters,
/// including the empty one.
pub(crate) fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < text.len() {
        if pi < pattern.len() && pattern[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if pi < pattern.len() && pattern[pi] == text[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(star_at) = star {
            // Backtrack: let the last '*' swallow one more character.
            pi = star_at + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_get_set() {
        let backend = MemoryBackend::with_defaults();

        let written = backend
            .set("key1", b"value1".to_vec(), Some(Duration::from_secs(60)), false)
            .await
            .unwrap();
        assert!(written);

        let result = backend.get("key1").await.unwrap();
        assert_eq!(result, Some(b"value1".to_vec()));
    }

    #[tokio::test]
    async fn test_expired_reads_as_absent() {
        let backend = MemoryBackend::with_defaults();
        backend
            .set("key1", b"v".to_vec(), Some(Duration::from_millis(30)), false)
            .await
            .unwrap();
        assert!(backend.exists("key1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(backend.get("key1").await.unwrap(), None);
        assert!(!backend.exists("key1").await.unwrap());
        assert_eq!(backend.remaining_ttl("key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let backend = MemoryBackend::with_defaults();

        assert!(
            backend
                .set("key1", b"first".to_vec(), None, true)
                .await
                .unwrap()
        );
        assert!(
            !backend
                .set("key1", b"second".to_vec(), None, true)
                .await
                .unwrap()
        );
        assert_eq!(backend.get("key1").await.unwrap(), Some(b"first".to_vec()));

        // An expired value does not block the conditional write.
        backend
            .set("key2", b"old".to_vec(), Some(Duration::from_millis(20)), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            backend
                .set("key2", b"new".to_vec(), None, true)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_incr_fixed_window() {
        let backend = MemoryBackend::with_defaults();

        assert_eq!(
            backend
                .incr("count", Some(Duration::from_millis(80)))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            backend
                .incr("count", Some(Duration::from_millis(80)))
                .await
                .unwrap(),
            2
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        // Window elapsed: counter restarts.
        assert_eq!(
            backend
                .incr("count", Some(Duration::from_millis(80)))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_incr_rejects_non_counter() {
        let backend = MemoryBackend::with_defaults();
        backend
            .set("blob", b"not a number".to_vec(), None, false)
            .await
            .unwrap();
        assert!(backend.incr("blob", None).await.is_err());
    }

    #[tokio::test]
    async fn test_delete() {
        let backend = MemoryBackend::with_defaults();
        backend.set("key1", b"v".to_vec(), None, false).await.unwrap();

        assert!(backend.delete("key1").await.unwrap());
        assert!(!backend.delete("key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_matching() {
        let backend = MemoryBackend::with_defaults();
        for key in ["users:1", "users:2", "orders:1"] {
            backend.set(key, b"v".to_vec(), None, false).await.unwrap();
        }

        let deleted = backend.delete_matching("users:*").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(backend.get("users:1").await.unwrap(), None);
        assert!(backend.get("orders:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_locks() {
        let backend = MemoryBackend::with_defaults();
        let expire = Duration::from_secs(5);

        assert!(backend.acquire_lock("lk", "a", expire).await.unwrap());
        assert!(!backend.acquire_lock("lk", "b", expire).await.unwrap());

        // Wrong token must not release a lock someone else holds.
        assert!(!backend.release_lock("lk", "b").await.unwrap());
        assert!(backend.release_lock("lk", "a").await.unwrap());
        assert!(backend.acquire_lock("lk", "b", expire).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_acquirable() {
        let backend = MemoryBackend::with_defaults();
        assert!(
            backend
                .acquire_lock("lk", "a", Duration::from_millis(30))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(
            backend
                .acquire_lock("lk", "b", Duration::from_secs(5))
                .await
                .unwrap()
        );
        // The original holder's release must now be a no-op.
        assert!(!backend.release_lock("lk", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_remaining_ttl() {
        let backend = MemoryBackend::with_defaults();
        backend
            .set("key1", b"v".to_vec(), Some(Duration::from_secs(60)), false)
            .await
            .unwrap();
        backend.set("key2", b"v".to_vec(), None, false).await.unwrap();

        let ttl = backend.remaining_ttl("key1").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(58));

        assert_eq!(backend.remaining_ttl("key2").await.unwrap(), None);
        assert_eq!(backend.remaining_ttl("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_many() {
        let backend = MemoryBackend::with_defaults();
        backend.set("key1", b"a".to_vec(), None, false).await.unwrap();
        backend.set("key2", b"b".to_vec(), None, false).await.unwrap();

        let results = backend.get_many(&["key1", "missing", "key2"]).await.unwrap();
        assert_eq!(
            results,
            vec![Some(b"a".to_vec()), None, Some(b"b".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_bits() {
        let backend = MemoryBackend::with_defaults();

        backend.set_bits("bf", &[0, 9, 100], None).await.unwrap();
        assert_eq!(
            backend.get_bits("bf", &[0, 9, 100]).await.unwrap(),
            vec![true, true, true]
        );
        assert_eq!(
            backend.get_bits("bf", &[1, 8, 5000]).await.unwrap(),
            vec![false, false, false]
        );
        assert_eq!(
            backend.get_bits("missing", &[0, 1]).await.unwrap(),
            vec![false, false]
        );
    }

    #[tokio::test]
    async fn test_capacity_eviction() {
        let backend = MemoryBackend::new(MemoryConfig::with_capacity(2));

        backend.set("key1", b"a".to_vec(), None, false).await.unwrap();
        backend.set("key2", b"b".to_vec(), None, false).await.unwrap();
        backend.set("key3", b"c".to_vec(), None, false).await.unwrap();

        assert!(backend.len() <= 2);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired() {
        let backend = MemoryBackend::with_defaults();
        backend
            .set("key1", b"v".to_vec(), Some(Duration::from_millis(10)), false)
            .await
            .unwrap();
        backend.set("key2", b"v".to_vec(), None, false).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.sweep(), 1);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("users:*", "users:1"));
        assert!(wildcard_match("users:*", "users:"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("a*c*e", "abcde"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("users:*", "orders:1"));
        assert!(!wildcard_match("a*c", "ab"));
        assert!(!wildcard_match("exact", "exactly"));
    }
}
