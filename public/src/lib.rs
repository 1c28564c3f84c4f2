//! PartitionCache accelerates repeated analytical SQL workloads by
//! memoising, at fragment granularity, the set of partition-key values that
//! satisfy conjunctive predicates.
//!
//! Incoming queries are decomposed into canonically-hashed sub-queries
//! ("fragments"); the cache stores the partition-key set each fragment
//! matched, and [`apply_cache`] rewrites a query to scan only the
//! intersection of the cached sets.
//!
//! ```text
//! apply_cache(Q) ──▶ fragment hashes ──▶ cache intersection ──▶ rewritten Q
//!
//! push_to_original_query_queue(Q) ──▶ fragment generator ──▶ fragment queue
//!                                         │
//!                                         ▼
//!                                 executor pool ──▶ DBMS ──▶ cache
//! ```
//!
//! The fill pipeline runs either as the external `pcache-monitor` process
//! or entirely inside PostgreSQL via pg_cron (see
//! [`worker::processor`]).

pub use chrono;
pub use sqlx;

pub mod cache {
    pub use partitioncache_cache::*;
}

pub mod query {
    pub use partitioncache_query::*;
}

pub mod queue {
    pub use partitioncache_queue::*;
}

pub mod rewrite {
    pub use partitioncache_rewrite::*;
}

pub mod worker {
    pub use partitioncache_worker::*;
}

use anyhow::Result;
use partitioncache_cache::{CacheHandler, Datatype};
use std::sync::Arc;

pub use partitioncache_cache::create_cache_helper;
pub use partitioncache_query::{
    VariantGenOptions, compute_buffer_distance, generate_all_hashes,
    generate_all_query_hash_pairs,
};
pub use partitioncache_rewrite::{
    ApplyCacheOptions, CacheStats, ExtendOptions, Method, apply_cache, apply_cache_lazy,
    extend_query_with_partition_keys, extend_query_with_partition_keys_lazy,
    extend_query_with_spatial_filter, extend_query_with_spatial_filter_lazy, get_partition_keys,
    get_partition_keys_lazy,
};

/// Queue an original query for asynchronous caching by a fill worker.
pub async fn push_to_original_query_queue(
    query: &str,
    partition_key: &str,
    datatype: Option<Datatype>,
) -> Result<()> {
    let handler = partitioncache_queue::connect_queue_handler().await?;
    handler
        .push_to_original_query_queue(query, partition_key, datatype)
        .await?;
    handler.close().await;
    Ok(())
}

/// Queue an original query with an explicit starting priority.
pub async fn push_to_original_query_queue_with_priority(
    query: &str,
    partition_key: &str,
    datatype: Option<Datatype>,
    priority: i32,
) -> Result<()> {
    let handler = partitioncache_queue::connect_queue_handler().await?;
    handler
        .push_to_original_query_queue_with_priority(query, partition_key, datatype, priority)
        .await?;
    handler.close().await;
    Ok(())
}

/// Queue pre-computed `(fragment, hash)` pairs directly.
pub async fn push_to_query_fragment_queue(
    pairs: &[(String, String)],
    partition_key: &str,
    datatype: Option<Datatype>,
) -> Result<()> {
    let handler = partitioncache_queue::connect_queue_handler().await?;
    handler
        .push_to_query_fragment_queue(pairs, partition_key, datatype, None)
        .await?;
    handler.close().await;
    Ok(())
}

/// Queue `(fragment, hash)` pairs with an explicit starting priority.
pub async fn push_to_query_fragment_queue_with_priority(
    pairs: &[(String, String)],
    partition_key: &str,
    datatype: Option<Datatype>,
    priority: i32,
) -> Result<()> {
    let handler = partitioncache_queue::connect_queue_handler().await?;
    handler
        .push_to_query_fragment_queue_with_priority(pairs, partition_key, datatype, None, priority)
        .await?;
    handler.close().await;
    Ok(())
}

/// Convenience re-export with the concrete handler type erased.
pub type SharedCacheHandler = Arc<dyn CacheHandler>;
