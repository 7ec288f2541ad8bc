//! polycache-core: Core traits and types for the polycache toolkit
//!
//! This crate provides the foundational pieces the strategy layer is built
//! on: the backend capability set, key templates and call binding, TTL
//! specifications, the stored-entry envelope, pluggable serialization and
//! the detection sink.

mod entry;
mod error;
mod key;
mod traits;
mod ttl;

pub use entry::SoftEntry;
pub use error::{CacheError, Result};
pub use key::{BoundArgs, CallArgs, FnSignature, KeyTemplate, Param};
pub use traits::*;
pub use ttl::{TtlContext, TtlFn, TtlSpec, parse_duration, resolve_ttl, resolve_ttl_static};
