//! Core traits for cache and detection operations

mod backend;
mod serializer;
mod sink;

pub use backend::{BitsBackend, CacheBackend};
pub use serializer::{JsonSerializer, Serializer};
pub use sink::{CallEvent, CallOutcome, DetectionSink, MemorySink, NoopSink, capture_value};

#[cfg(feature = "msgpack")]
pub use serializer::MsgPackSerializer;

#[cfg(feature = "bincode")]
pub use serializer::BincodeSerializer;

#[cfg(feature = "tracing")]
pub use sink::TracingSink;

#[cfg(feature = "metrics")]
pub use sink::MetricsSink;
