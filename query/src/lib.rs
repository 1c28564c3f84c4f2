//! Query fragmentation and canonical hashing.
//!
//! Decomposes a SQL query into the set of sub-queries ("fragments") whose
//! results can be cached per partition key, and hashes each fragment's
//! canonical text so that semantically overlapping queries share cache
//! entries.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Buffer distance for spatial filters (weighted diameter of distance constraints)
pub mod buffer;
/// Extraction and grouping of WHERE conjuncts by the tables they touch
pub mod conditions;
/// Constraint edits: added per-table predicates, removed attributes, orphan pruning
pub mod constraints;
/// Assembly of fragment SQL from table-subset variants
pub mod fragments;
/// Adjacency-map graph helpers (connected subgraphs, reachability)
pub mod graph;
/// Fragment hashing and the top-level pair generation entry points
pub mod hashing;
/// Query cleaning, join normalization and distance bucketisation
pub mod normalize;
/// Variant generation options
pub mod options;
/// Shared sqlparser helpers
pub mod parse;
/// Partition-join (star) table detection
pub mod partition_join;

pub use buffer::compute_buffer_distance;
pub use fragments::generate_partial_queries;
pub use hashing::{generate_all_hashes, generate_all_query_hash_pairs, hash_query};
pub use options::VariantGenOptions;
pub use partition_join::detect_partition_join_from_query;
