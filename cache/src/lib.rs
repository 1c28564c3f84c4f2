//! Partition-set cache: pluggable key→set stores with an intersection engine.
//!
//! A cache entry maps `(partition_key, fragment_hash)` to a set of partition
//! key values, a NULL match-all sentinel, or a tombstone. Backends differ in
//! the physical set representation (typed arrays, fixed-width bitstrings,
//! compressed bitmaps, in-process sets) but share the bookkeeping schema and
//! the capability model.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Environment-driven configuration
pub mod config;
/// Configuration-kind errors, mapped to exit code 1 by the CLI
pub mod errors;
/// Export/import records for cache migration
pub mod export;
/// Handler traits, capability accessors and the backend factory
pub mod handler;
/// SQL identifier and hash validation
pub mod identifiers;
/// In-process backend used by tests and co-located callers
pub mod memory;
/// Datatypes, values, payload variants
pub mod model;
/// PostgreSQL-resident backends
pub mod postgres;

pub use config::CacheEnv;
pub use errors::ConfigError;
pub use handler::{
    CacheHandler, LazyCacheHandler, RegisterOptions, SpatialCacheHandler, create_cache_helper,
};
pub use memory::MemoryCacheHandler;
pub use model::{CacheEntry, Datatype, EvictionStrategy, QueryRecord, QueryStatus, Value, ValueSet};
