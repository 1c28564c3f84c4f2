use crate::config::CacheEnv;
use crate::errors::ConfigError;
use crate::memory::MemoryCacheHandler;
use crate::model::{
    CacheEntry, Datatype, EvictionStrategy, QueryRecord, QueryStatus, ValueSet,
};
use crate::postgres::array::PostgresArrayCacheHandler;
use crate::postgres::bit::PostgresBitCacheHandler;
use crate::postgres::roaring::PostgresRoaringCacheHandler;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Per-partition registration options.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Bit-vector width for bit backends; ignored elsewhere
    pub bitsize: Option<i64>,
}

/// Core capability shared by every cache backend.
///
/// Backends additionally declaring the `lazy` or `spatial` capability expose
/// it through the accessors; call sites needing a capability check and fail
/// with a configuration error instead of probing at runtime.
#[async_trait]
pub trait CacheHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn supported_datatypes(&self) -> &'static [Datatype];

    fn lazy(&self) -> Option<&dyn LazyCacheHandler> {
        None
    }

    fn spatial(&self) -> Option<&dyn SpatialCacheHandler> {
        None
    }

    /// Create the bookkeeping tables. Idempotent.
    async fn setup(&self) -> Result<()>;

    /// Register a partition key. Idempotent; conflicting datatypes fail.
    async fn register_partition_key(
        &self,
        partition_key: &str,
        datatype: Datatype,
        options: &RegisterOptions,
    ) -> Result<()>;

    /// Store a payload set. The empty set stores nothing and succeeds.
    async fn set_cache(&self, hash: &str, values: &ValueSet, partition_key: &str) -> Result<()>;

    /// Store the NULL match-all sentinel.
    async fn set_null(&self, hash: &str, partition_key: &str) -> Result<()>;

    async fn set_query(&self, hash: &str, query_text: &str, partition_key: &str) -> Result<()>;

    async fn set_query_status(
        &self,
        hash: &str,
        partition_key: &str,
        status: QueryStatus,
    ) -> Result<()>;

    async fn get_query_status(
        &self,
        hash: &str,
        partition_key: &str,
    ) -> Result<Option<QueryStatus>>;

    async fn get_query(&self, hash: &str, partition_key: &str) -> Result<Option<String>>;

    /// The stored payload, the NULL sentinel, a tombstone, or `None` on miss.
    async fn get(&self, hash: &str, partition_key: &str) -> Result<Option<CacheEntry>>;

    /// True iff a payload row exists; with `check_query`, tombstoned
    /// attempts count as well.
    async fn exists(&self, hash: &str, partition_key: &str, check_query: bool) -> Result<bool>;

    async fn filter_existing_keys(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<BTreeSet<String>>;

    /// Intersect the payloads of every present key. NULL entries are
    /// identity elements. Returns `(None, 0)` when nothing is present and
    /// `(None, n)` when only NULL entries matched.
    async fn get_intersected(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<(Option<ValueSet>, usize)>;

    async fn delete(&self, hash: &str, partition_key: &str) -> Result<()>;

    /// Remove a whole partition including its metadata.
    async fn delete_partition(&self, partition_key: &str) -> Result<()>;

    async fn get_all_keys(&self, partition_key: &str) -> Result<Vec<String>>;

    async fn get_all_queries(&self, partition_key: &str) -> Result<Vec<QueryRecord>>;

    async fn get_partition_keys(&self) -> Result<Vec<(String, Datatype)>>;

    async fn get_datatype(&self, partition_key: &str) -> Result<Option<Datatype>>;

    async fn entry_count(&self, partition_key: &str) -> Result<i64>;

    /// Remove queries (and their payloads) not seen for `days` days.
    async fn prune_old_queries(&self, days: i64) -> Result<u64>;

    /// Shrink the partition to at most `threshold` entries.
    async fn evict(
        &self,
        partition_key: &str,
        strategy: EvictionStrategy,
        threshold: i64,
    ) -> Result<u64>;

    /// Drop tombstoned entries so their fragments may be re-evaluated.
    async fn remove_tombstones(&self, partition_key: &str) -> Result<u64>;

    /// Drop entries whose payload holds more than `max_count` values.
    async fn remove_large_entries(&self, partition_key: &str, max_count: i64) -> Result<u64>;

    /// Release resources. Idempotent.
    async fn close(&self);
}

/// Lazy capability: the backend lives in the same DBMS as the target query
/// and can express intersections (and stores) as SQL instead of
/// materialising sets in the client.
#[async_trait]
pub trait LazyCacheHandler: Send + Sync {
    /// A sub-query that evaluates to the intersection, plus the hit count.
    async fn get_intersected_lazy(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<(Option<String>, usize)>;

    /// Evaluate the fragment inside the cache DBMS, streaming its result
    /// into the payload table in one statement.
    async fn set_cache_lazy(
        &self,
        hash: &str,
        fragment_sql: &str,
        original_query: &str,
        partition_key: &str,
    ) -> Result<()>;
}

/// Spatial capability for geometry partitions.
#[async_trait]
pub trait SpatialCacheHandler: Send + Sync {
    /// Pre-computed filter geometry as WKB plus its SRID.
    async fn get_spatial_filter(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
        buffer_distance: f64,
    ) -> Result<Option<(Vec<u8>, i32)>>;

    /// A sub-query evaluating to the filter geometry.
    async fn get_spatial_filter_lazy(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
        buffer_distance: f64,
    ) -> Result<Option<String>>;
}

async fn connect(env: &CacheEnv) -> Result<sqlx::PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(8)
        .connect(&env.connection_string())
        .await?)
}

/// Build a cache handler from the environment for the given backend name.
pub async fn make_cache_handler(backend: &str) -> Result<Arc<dyn CacheHandler>> {
    match backend {
        "memory" => Ok(Arc::new(MemoryCacheHandler::new())),
        "postgresql_array" => {
            let env = CacheEnv::from_env()?;
            let pool = connect(&env).await?;
            let handler = PostgresArrayCacheHandler::new(pool, &env.table_prefix)?;
            handler.setup().await?;
            Ok(Arc::new(handler))
        }
        "postgresql_bit" => {
            let env = CacheEnv::from_env()?;
            let pool = connect(&env).await?;
            let handler = PostgresBitCacheHandler::new(pool, &env.table_prefix, env.bitsize)?;
            handler.setup().await?;
            Ok(Arc::new(handler))
        }
        "postgresql_roaringbit" => {
            let env = CacheEnv::from_env()?;
            let pool = connect(&env).await?;
            let handler = PostgresRoaringCacheHandler::new(pool, &env.table_prefix)?;
            handler.setup().await?;
            Ok(Arc::new(handler))
        }
        other => Err(ConfigError::UnknownBackend(other.to_string()).into()),
    }
}

/// Build a handler and register the partition key in one call; the entry
/// point host applications use.
pub async fn create_cache_helper(
    backend: &str,
    partition_key: &str,
    datatype: Datatype,
) -> Result<Arc<dyn CacheHandler>> {
    let handler = make_cache_handler(backend).await?;
    handler
        .register_partition_key(partition_key, datatype, &RegisterOptions::default())
        .await?;
    info!(
        "created cache helper backend={backend} partition_key={partition_key} datatype={datatype}"
    );
    Ok(handler)
}
