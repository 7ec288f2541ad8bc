//! polycache-storage: Storage backends for polycache

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryBackend, MemoryConfig};
