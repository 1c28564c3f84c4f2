//! Query rewriting against the partition-set cache.
//!
//! `apply_cache` generates the fragment hashes of an incoming query, looks
//! up the intersection of the cached partition-key sets, and splices the
//! restriction back into the query with one of several physical strategies
//! (IN-list, VALUES, temp-table IN, temp-table JOIN, lazy sub-query).

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// The apply-cache entry points
pub mod apply;
/// Splice-only primitives for partition-key restrictions
pub mod extend;
/// Options, methods and statistics
pub mod options;
/// Spatial filter splicing
pub mod spatial;

pub use apply::{
    apply_cache, apply_cache_lazy, find_anchor_alias, get_partition_keys, get_partition_keys_lazy,
    rewrite_query_with_p0_table,
};
pub use extend::{extend_query_with_partition_keys, extend_query_with_partition_keys_lazy};
pub use options::{ApplyCacheOptions, CacheStats, ExtendOptions, Method};
pub use spatial::{extend_query_with_spatial_filter, extend_query_with_spatial_filter_lazy};
