//! Tag registry for bulk invalidation
//!
//! Registrations may attach tags; invalidating a tag removes every entry
//! written under any template bound to it. Two modes:
//!
//! - [`InvalidationMode::Purge`]: delete matching keys from the backend
//!   with a wildcard scan. Immediate, but the scan cost scales with the
//!   keyspace.
//! - [`InvalidationMode::Version`]: bump a per-template version counter
//!   that is appended to every key. Old entries are never touched and age
//!   out by their own expiry; new reads miss instantly. O(1) regardless of
//!   how many entries the tag covers.
//!
//! The mode is fixed when the registry is created so every registration
//! sharing it agrees on the key shape.

use std::collections::HashSet;

use dashmap::DashMap;

use polycache_core::{CacheBackend, CacheError, KeyTemplate, Result};

/// How [`TagRegistry::invalidate`] takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationMode {
    #[default]
    Purge,
    Version,
}

/// Maps tags to the key templates registered under them.
#[derive(Debug, Default)]
pub struct TagRegistry {
    mode: InvalidationMode,
    bindings: DashMap<String, HashSet<String>>,
    patterns: DashMap<String, String>,
    versions: DashMap<String, u64>,
}

impl TagRegistry {
    pub fn new(mode: InvalidationMode) -> Self {
        Self {
            mode,
            bindings: DashMap::new(),
            patterns: DashMap::new(),
            versions: DashMap::new(),
        }
    }

    pub fn mode(&self) -> InvalidationMode {
        self.mode
    }

    /// Register a template under a tag. Called during strategy build; the
    /// same template may carry several tags and the same tag may cover
    /// several templates.
    pub fn bind(&self, tag: &str, template: &KeyTemplate) {
        let source = template.source().to_string();
        self.bindings
            .entry(tag.to_string())
            .or_default()
            .insert(source.clone());
        self.patterns.insert(source.clone(), template.match_pattern());
        self.versions.entry(source).or_insert(0);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.bindings.contains_key(tag)
    }

    /// Apply the registry's key qualification to a resolved key. A no-op in
    /// purge mode and until the first version bump.
    pub fn qualify(&self, template: &KeyTemplate, key: String) -> String {
        if self.mode != InvalidationMode::Version {
            return key;
        }
        match self.versions.get(template.source()) {
            Some(version) if *version > 0 => format!("{key}:v{}", *version),
            _ => key,
        }
    }

    /// Invalidate every entry written under the tag. Returns the number of
    /// keys deleted in purge mode, the number of templates bumped in
    /// version mode.
    pub async fn invalidate<B: CacheBackend>(&self, backend: &B, tag: &str) -> Result<u64> {
        let sources: Vec<String> = match self.bindings.get(tag) {
            Some(bound) => bound.iter().cloned().collect(),
            None => {
                return Err(CacheError::Configuration(format!(
                    "unknown tag '{tag}'"
                )));
            }
        };

        match self.mode {
            InvalidationMode::Purge => {
                // Collect patterns before awaiting; map guards are not held
                // across suspension points.
                let patterns: Vec<String> = sources
                    .iter()
                    .filter_map(|source| self.patterns.get(source).map(|p| p.clone()))
                    .collect();
                let mut removed = 0;
                for pattern in patterns {
                    removed += backend.delete_matching(&pattern).await?;
                }
                Ok(removed)
            }
            InvalidationMode::Version => {
                for source in &sources {
                    *self.versions.entry(source.clone()).or_insert(0) += 1;
                }
                Ok(sources.len() as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use polycache_core::FnSignature;
    use polycache_storage::MemoryBackend;

    fn template(prefix: &str) -> KeyTemplate {
        let sig = FnSignature::new("lookup").param("id");
        KeyTemplate::derive(&sig, None, prefix).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        let registry = TagRegistry::default();
        let backend = MemoryBackend::with_defaults();

        let err = registry.invalidate(&backend, "ghost").await.unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_purge_deletes_bound_keys() {
        let registry = TagRegistry::default();
        let template = template("users");
        registry.bind("users", &template);

        let backend = MemoryBackend::with_defaults();
        backend.set("users:lookup(id=1)", b"a".to_vec(), None, false).await.unwrap();
        backend.set("users:lookup(id=2)", b"b".to_vec(), None, false).await.unwrap();
        backend.set("orders:lookup(id=1)", b"c".to_vec(), None, false).await.unwrap();

        let removed = registry.invalidate(&backend, "users").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.get("users:lookup(id=1)").await.unwrap(), None);
        assert!(backend.get("orders:lookup(id=1)").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_version_qualifies_after_bump() {
        let registry = TagRegistry::new(InvalidationMode::Version);
        let template = template("users");
        registry.bind("users", &template);

        let key = "users:lookup(id=1)".to_string();
        assert_eq!(registry.qualify(&template, key.clone()), key);

        let backend = MemoryBackend::with_defaults();
        let bumped = registry.invalidate(&backend, "users").await.unwrap();
        assert_eq!(bumped, 1);
        assert_eq!(
            registry.qualify(&template, key.clone()),
            "users:lookup(id=1):v1"
        );

        registry.invalidate(&backend, "users").await.unwrap();
        assert_eq!(registry.qualify(&template, key), "users:lookup(id=1):v2");
    }

    #[tokio::test]
    async fn test_tag_covers_multiple_templates() {
        let registry = TagRegistry::default();
        let users = template("users");
        let sig = FnSignature::new("profile").param("id");
        let profiles = KeyTemplate::derive(&sig, None, "profiles").unwrap();
        registry.bind("accounts", &users);
        registry.bind("accounts", &profiles);

        let backend = MemoryBackend::with_defaults();
        backend.set("users:lookup(id=1)", b"a".to_vec(), None, false).await.unwrap();
        backend.set("profiles:profile(id=1)", b"b".to_vec(), None, false).await.unwrap();

        let removed = registry.invalidate(&backend, "accounts").await.unwrap();
        assert_eq!(removed, 2);
    }
}
