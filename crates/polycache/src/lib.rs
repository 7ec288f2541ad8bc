//! polycache: Function-level caching strategies for async Rust
//!
//! # Features
//!
//! - **Declarative key templates** derived from function signatures
//! - **Soft expiry and early refresh** for stale-tolerant serving
//! - **Stampede protection** with distributed locks
//! - **Failover, circuit breaker, rate limit and bloom gates**
//! - **Tag-based bulk invalidation** (purge or version)
//! - **Pluggable serialization** (JSON, MessagePack, Bincode)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use polycache::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(MemoryBackend::with_defaults());
//!
//!     let cache = SimpleCache::<String, _>::builder(
//!         backend,
//!         FnSignature::new("user_name").param("id"),
//!         "10m",
//!     )
//!     .prefix("users")
//!     .build()?;
//!
//!     let fetch = wrap_fn(|args: CallArgs| async move {
//!         Ok(format!("user-{}", args.positionals().join(",")))
//!     });
//!     let cached = cache.wrap(fetch);
//!
//!     let name = cached(CallArgs::new().positional(42)).await?;
//!     println!("{name}");
//!     Ok(())
//! }
//! ```

pub mod strategy;
pub mod tags;

// Re-export core
pub use polycache_core::*;

// Re-export storage
#[cfg(feature = "memory")]
pub use polycache_storage::{MemoryBackend, MemoryConfig};

pub use strategy::{
    CacheValue, CallFuture, Condition, FailurePredicate, Strategy, WrappedCall,
    any_computation_failure, computation_failure_of, stack, wrap_fn,
};

pub use strategy::bloom::{BloomGate, DualBloomGate};
pub use strategy::circuit::{CircuitBreaker, CircuitState};
pub use strategy::early::EarlyCache;
pub use strategy::failover::FailoverCache;
pub use strategy::locked::Locked;
pub use strategy::rate::RateLimiter;
pub use strategy::simple::SimpleCache;
pub use strategy::soft::SoftCache;

pub use tags::{InvalidationMode, TagRegistry};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BloomGate, CacheError, CallArgs, CallOutcome, CircuitBreaker, CircuitState,
        DualBloomGate, EarlyCache, FailoverCache, FnSignature, InvalidationMode, JsonSerializer,
        KeyTemplate, Locked, MemorySink, RateLimiter, Result, Serializer, SimpleCache, SoftCache,
        Strategy, TagRegistry, TtlSpec, WrappedCall, any_computation_failure,
        computation_failure_of, stack, wrap_fn,
    };

    #[cfg(feature = "memory")]
    pub use crate::{MemoryBackend, MemoryConfig};

    #[cfg(feature = "msgpack")]
    pub use crate::MsgPackSerializer;

    #[cfg(feature = "bincode")]
    pub use crate::BincodeSerializer;
}
