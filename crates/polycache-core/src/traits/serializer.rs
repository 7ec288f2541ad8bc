//! Pluggable serialization trait

use crate::error::CacheError;
use serde::{Serialize, de::DeserializeOwned};

/// Trait for pluggable serialization formats
///
/// Strategies serialize payloads (and their envelopes) through this trait
/// before anything reaches a backend. Built-in implementations: JSON,
/// MessagePack, Bincode.
pub trait Serializer: Send + Sync + Clone + 'static {
    /// Name of the serializer (for debugging/metrics)
    fn name(&self) -> &str;

    /// Serialize a value to bytes
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CacheError>;

    /// Deserialize bytes to a value
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError>;
}

/// JSON serializer (default)
///
/// Human-readable and friendly to inspection while debugging a cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Deserialization(e.to_string()))
    }
}

/// MessagePack serializer (optional)
///
/// More compact than JSON, not human-readable. Enable with the `msgpack`
/// feature.
#[cfg(feature = "msgpack")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

#[cfg(feature = "msgpack")]
impl Serializer for MsgPackSerializer {
    fn name(&self) -> &str {
        "msgpack"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CacheError> {
        rmp_serde::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::Deserialization(e.to_string()))
    }
}

/// Bincode serializer (optional)
///
/// Fastest and most compact, but neither human-readable nor cross-language.
/// Enable with the `bincode` feature.
#[cfg(feature = "bincode")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

#[cfg(feature = "bincode")]
impl Serializer for BincodeSerializer {
    fn name(&self) -> &str {
        "bincode"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CacheError> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError> {
        let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CacheError::Deserialization(e.to_string()))?;
        Ok(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::SoftEntry;
    use std::time::Duration;

    #[test]
    fn test_json_roundtrip() {
        let serializer = JsonSerializer;
        let value = vec!["a".to_string(), "b".to_string()];

        let bytes = serializer.serialize(&value).unwrap();
        let decoded: Vec<String> = serializer.deserialize(&bytes).unwrap();

        assert_eq!(value, decoded);
    }

    #[test]
    fn test_json_envelope() {
        let serializer = JsonSerializer;
        let entry = SoftEntry::new(42u64, Duration::from_secs(10));

        let bytes = serializer.serialize(&entry).unwrap();
        let decoded: SoftEntry<u64> = serializer.deserialize(&bytes).unwrap();

        assert_eq!(decoded, entry);
        assert!(decoded.is_fresh());
    }

    #[test]
    fn test_json_rejects_garbage() {
        let serializer = JsonSerializer;
        let result: Result<u32, _> = serializer.deserialize(b"not json");
        assert!(matches!(result, Err(CacheError::Deserialization(_))));
    }

    #[cfg(feature = "msgpack")]
    #[test]
    fn test_msgpack_roundtrip() {
        let serializer = MsgPackSerializer;
        let entry = SoftEntry::new("payload".to_string(), Duration::from_secs(5));

        let bytes = serializer.serialize(&entry).unwrap();
        let decoded: SoftEntry<String> = serializer.deserialize(&bytes).unwrap();

        assert_eq!(decoded, entry);
    }
}
