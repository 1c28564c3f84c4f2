use crate::errors::ConfigError;
use crate::handler::{CacheHandler, LazyCacheHandler, RegisterOptions, SpatialCacheHandler};
use crate::model::{
    CacheEntry, Datatype, EvictionStrategy, QueryRecord, QueryStatus, Value, ValueSet,
};
use crate::postgres::PgBackendCore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use tracing::debug;

/// Sorted-array backend: one row per hash, payload is a typed SQL array.
/// Supports every datatype; intersection happens inside PostgreSQL by
/// unnesting and counting. Declares the lazy capability, and the spatial
/// capability for geometry partitions.
pub struct PostgresArrayCacheHandler {
    core: PgBackendCore,
}

const SUPPORTED: &[Datatype] = &[
    Datatype::Integer,
    Datatype::Float,
    Datatype::Text,
    Datatype::Timestamp,
    Datatype::Geometry,
];

fn typed_vecs(values: &ValueSet, datatype: Datatype) -> Result<TypedValues> {
    let mismatch = || {
        anyhow::anyhow!(
            "value set does not match the registered datatype '{}'",
            datatype.as_str()
        )
    };
    Ok(match datatype {
        Datatype::Integer => TypedValues::Int(
            values
                .iter()
                .map(|v| match v {
                    Value::Int(i) => Ok(*i),
                    _ => Err(mismatch()),
                })
                .collect::<Result<_>>()?,
        ),
        Datatype::Float => TypedValues::Float(
            values
                .iter()
                .map(|v| match v {
                    Value::Float(f) => Ok(*f),
                    Value::Int(i) => Ok(*i as f64),
                    _ => Err(mismatch()),
                })
                .collect::<Result<_>>()?,
        ),
        Datatype::Text => TypedValues::Text(
            values
                .iter()
                .map(|v| match v {
                    Value::Text(s) => Ok(s.clone()),
                    _ => Err(mismatch()),
                })
                .collect::<Result<_>>()?,
        ),
        Datatype::Timestamp => TypedValues::Timestamp(
            values
                .iter()
                .map(|v| match v {
                    Value::Timestamp(t) => Ok(*t),
                    _ => Err(mismatch()),
                })
                .collect::<Result<_>>()?,
        ),
        Datatype::Geometry => TypedValues::Bytes(
            values
                .iter()
                .map(|v| match v {
                    Value::Geometry(b) => Ok(b.clone()),
                    _ => Err(mismatch()),
                })
                .collect::<Result<_>>()?,
        ),
    })
}

enum TypedValues {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Text(Vec<String>),
    Timestamp(Vec<DateTime<Utc>>),
    Bytes(Vec<Vec<u8>>),
}

impl PostgresArrayCacheHandler {
    pub fn new(pool: PgPool, table_prefix: &str) -> Result<Self> {
        Ok(Self {
            core: PgBackendCore::new(pool, table_prefix)?,
        })
    }

    async fn datatype_or_register(
        &self,
        partition_key: &str,
        values: &ValueSet,
    ) -> Result<Datatype> {
        if let Some((datatype, _)) = self.core.get_metadata(partition_key).await? {
            return Ok(datatype);
        }
        let datatype = values
            .iter()
            .next()
            .map(Value::datatype)
            .unwrap_or(Datatype::Integer);
        self.register_partition_key(partition_key, datatype, &RegisterOptions::default())
            .await?;
        Ok(datatype)
    }

    /// Intersection of the non-NULL payload rows: unnest, group, and keep
    /// values present in every row.
    async fn intersect_values(
        &self,
        non_null_keys: &[String],
        partition_key: &str,
        datatype: Datatype,
    ) -> Result<ValueSet> {
        let sql = format!(
            "SELECT x.value FROM (
                 SELECT unnest(partition_keys) AS value, query_hash FROM {cache}
                 WHERE query_hash = ANY($1)
             ) x GROUP BY x.value HAVING COUNT(DISTINCT x.query_hash) = $2",
            cache = self.core.cache_table(partition_key)?
        );
        let query = sqlx::query(&sql)
            .bind(non_null_keys.to_vec())
            .bind(non_null_keys.len() as i64);
        let rows = query.fetch_all(&self.core.pool).await?;
        let mut result = ValueSet::new();
        for row in rows {
            let value = match datatype {
                Datatype::Integer => Value::Int(row.try_get::<i64, _>("value")?),
                Datatype::Float => Value::Float(row.try_get::<f64, _>("value")?),
                Datatype::Text => Value::Text(row.try_get::<String, _>("value")?),
                Datatype::Timestamp => Value::Timestamp(row.try_get::<DateTime<Utc>, _>("value")?),
                Datatype::Geometry => Value::Geometry(row.try_get::<Vec<u8>, _>("value")?),
            };
            result.insert(value);
        }
        Ok(result)
    }

    /// Existing payload rows split into the hit count and the non-NULL keys
    /// that take part in the intersection.
    async fn payload_split(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<(usize, Vec<String>)> {
        let rows = self.core.existing_payload_rows(keys, partition_key).await?;
        let hits = rows.len();
        let non_null = rows
            .into_iter()
            .filter(|(_, is_null)| !is_null)
            .map(|(hash, _)| hash)
            .collect();
        Ok((hits, non_null))
    }

    fn lazy_intersection_sql(
        &self,
        non_null_keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<String> {
        let cache = self.core.cache_table(partition_key)?;
        let hashes = PgBackendCore::quoted_hash_list(non_null_keys)?;
        Ok(format!(
            "(SELECT x.value AS {partition_key} FROM (
                 SELECT unnest(partition_keys) AS value, query_hash FROM {cache}
                 WHERE query_hash IN ({hashes})
             ) x GROUP BY x.value HAVING COUNT(DISTINCT x.query_hash) = {n})",
            n = non_null_keys.len()
        ))
    }
}

#[async_trait]
impl CacheHandler for PostgresArrayCacheHandler {
    fn name(&self) -> &'static str {
        "postgresql_array"
    }

    fn supported_datatypes(&self) -> &'static [Datatype] {
        SUPPORTED
    }

    fn lazy(&self) -> Option<&dyn LazyCacheHandler> {
        Some(self)
    }

    fn spatial(&self) -> Option<&dyn SpatialCacheHandler> {
        Some(self)
    }

    async fn setup(&self) -> Result<()> {
        self.core.create_bookkeeping_tables().await
    }

    async fn register_partition_key(
        &self,
        partition_key: &str,
        datatype: Datatype,
        _options: &RegisterOptions,
    ) -> Result<()> {
        self.core
            .register_metadata(partition_key, datatype, None, self.name(), SUPPORTED)
            .await?;
        let (registered, _) = self
            .core
            .get_metadata(partition_key)
            .await?
            .unwrap_or((datatype, None));
        self.core
            .ensure_cache_table(partition_key, registered.array_column_type())
            .await
    }

    async fn set_cache(&self, hash: &str, values: &ValueSet, partition_key: &str) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let datatype = self.datatype_or_register(partition_key, values).await?;
        let sql = format!(
            "INSERT INTO {cache} (query_hash, partition_keys, partition_keys_count)
             VALUES ($1, $2, $3)
             ON CONFLICT (query_hash) DO UPDATE SET
                 partition_keys = EXCLUDED.partition_keys,
                 partition_keys_count = EXCLUDED.partition_keys_count",
            cache = self.core.cache_table(partition_key)?
        );
        let count = values.len() as i64;
        let query = sqlx::query(&sql).bind(hash);
        match typed_vecs(values, datatype)? {
            TypedValues::Int(v) => query.bind(v).bind(count).execute(&self.core.pool).await?,
            TypedValues::Float(v) => query.bind(v).bind(count).execute(&self.core.pool).await?,
            TypedValues::Text(v) => query.bind(v).bind(count).execute(&self.core.pool).await?,
            TypedValues::Timestamp(v) => query.bind(v).bind(count).execute(&self.core.pool).await?,
            TypedValues::Bytes(v) => query.bind(v).bind(count).execute(&self.core.pool).await?,
        };
        self.core.touch_query(hash, partition_key).await?;
        debug!("stored {count} values for {hash} in partition '{partition_key}'");
        Ok(())
    }

    async fn set_null(&self, hash: &str, partition_key: &str) -> Result<()> {
        if self.core.get_metadata(partition_key).await?.is_none() {
            self.register_partition_key(partition_key, Datatype::Integer, &RegisterOptions::default())
                .await?;
        }
        let sql = format!(
            "INSERT INTO {cache} (query_hash, partition_keys, partition_keys_count)
             VALUES ($1, NULL, NULL)
             ON CONFLICT (query_hash) DO UPDATE SET
                 partition_keys = NULL, partition_keys_count = NULL",
            cache = self.core.cache_table(partition_key)?
        );
        sqlx::query(&sql).bind(hash).execute(&self.core.pool).await?;
        self.core.touch_query(hash, partition_key).await?;
        Ok(())
    }

    async fn set_query(&self, hash: &str, query_text: &str, partition_key: &str) -> Result<()> {
        self.core.set_query(hash, query_text, partition_key).await
    }

    async fn set_query_status(
        &self,
        hash: &str,
        partition_key: &str,
        status: QueryStatus,
    ) -> Result<()> {
        self.core.set_query_status(hash, partition_key, status).await
    }

    async fn get_query_status(
        &self,
        hash: &str,
        partition_key: &str,
    ) -> Result<Option<QueryStatus>> {
        self.core.get_query_status(hash, partition_key).await
    }

    async fn get_query(&self, hash: &str, partition_key: &str) -> Result<Option<String>> {
        self.core.get_query(hash, partition_key).await
    }

    async fn get(&self, hash: &str, partition_key: &str) -> Result<Option<CacheEntry>> {
        let Some((datatype, _)) = self.core.get_metadata(partition_key).await? else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT partition_keys FROM {cache} WHERE query_hash = $1",
            cache = self.core.cache_table(partition_key)?
        );
        let row = sqlx::query(&sql)
            .bind(hash)
            .fetch_optional(&self.core.pool)
            .await?;
        if let Some(row) = row {
            let entry = match datatype {
                Datatype::Integer => row
                    .try_get::<Option<Vec<i64>>, _>("partition_keys")?
                    .map(|v| v.into_iter().map(Value::Int).collect::<ValueSet>()),
                Datatype::Float => row
                    .try_get::<Option<Vec<f64>>, _>("partition_keys")?
                    .map(|v| v.into_iter().map(Value::Float).collect::<ValueSet>()),
                Datatype::Text => row
                    .try_get::<Option<Vec<String>>, _>("partition_keys")?
                    .map(|v| v.into_iter().map(Value::Text).collect::<ValueSet>()),
                Datatype::Timestamp => row
                    .try_get::<Option<Vec<DateTime<Utc>>>, _>("partition_keys")?
                    .map(|v| v.into_iter().map(Value::Timestamp).collect::<ValueSet>()),
                Datatype::Geometry => row
                    .try_get::<Option<Vec<Vec<u8>>>, _>("partition_keys")?
                    .map(|v| v.into_iter().map(Value::Geometry).collect::<ValueSet>()),
            };
            return Ok(Some(match entry {
                Some(values) => CacheEntry::Set(values),
                None => CacheEntry::Null,
            }));
        }
        Ok(match self.core.get_query_status(hash, partition_key).await? {
            Some(status) if status.is_tombstone() => Some(CacheEntry::Tombstone(status)),
            _ => None,
        })
    }

    async fn exists(&self, hash: &str, partition_key: &str, check_query: bool) -> Result<bool> {
        self.core.exists(hash, partition_key, check_query).await
    }

    async fn filter_existing_keys(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<BTreeSet<String>> {
        self.core.filter_existing_keys(keys, partition_key).await
    }

    async fn get_intersected(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<(Option<ValueSet>, usize)> {
        let Some((datatype, _)) = self.core.get_metadata(partition_key).await? else {
            return Ok((None, 0));
        };
        let (hits, non_null) = self.payload_split(keys, partition_key).await?;
        if hits == 0 {
            return Ok((None, 0));
        }
        if non_null.is_empty() {
            // only match-all sentinels hit: no restriction to report
            return Ok((None, hits));
        }
        let values = self
            .intersect_values(&non_null, partition_key, datatype)
            .await?;
        Ok((Some(values), hits))
    }

    async fn delete(&self, hash: &str, partition_key: &str) -> Result<()> {
        self.core.delete_entry(hash, partition_key).await
    }

    async fn delete_partition(&self, partition_key: &str) -> Result<()> {
        self.core.delete_partition(partition_key).await
    }

    async fn get_all_keys(&self, partition_key: &str) -> Result<Vec<String>> {
        self.core.get_all_keys(partition_key).await
    }

    async fn get_all_queries(&self, partition_key: &str) -> Result<Vec<QueryRecord>> {
        self.core.get_all_queries(partition_key).await
    }

    async fn get_partition_keys(&self) -> Result<Vec<(String, Datatype)>> {
        self.core.get_partition_keys().await
    }

    async fn get_datatype(&self, partition_key: &str) -> Result<Option<Datatype>> {
        Ok(self
            .core
            .get_metadata(partition_key)
            .await?
            .map(|(datatype, _)| datatype))
    }

    async fn entry_count(&self, partition_key: &str) -> Result<i64> {
        self.core.entry_count(partition_key).await
    }

    async fn prune_old_queries(&self, days: i64) -> Result<u64> {
        self.core.prune_old_queries(days).await
    }

    async fn evict(
        &self,
        partition_key: &str,
        strategy: EvictionStrategy,
        threshold: i64,
    ) -> Result<u64> {
        self.core.evict(partition_key, strategy, threshold).await
    }

    async fn remove_tombstones(&self, partition_key: &str) -> Result<u64> {
        self.core.remove_tombstones(partition_key).await
    }

    async fn remove_large_entries(&self, partition_key: &str, max_count: i64) -> Result<u64> {
        self.core.remove_large_entries(partition_key, max_count).await
    }

    async fn close(&self) {
        self.core.pool.close().await;
    }
}

#[async_trait]
impl LazyCacheHandler for PostgresArrayCacheHandler {
    async fn get_intersected_lazy(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<(Option<String>, usize)> {
        let (hits, non_null) = self.payload_split(keys, partition_key).await?;
        if hits == 0 {
            return Ok((None, 0));
        }
        if non_null.is_empty() {
            return Ok((None, hits));
        }
        let non_null: BTreeSet<String> = non_null.into_iter().collect();
        let sql = self.lazy_intersection_sql(&non_null, partition_key)?;
        Ok((Some(sql), hits))
    }

    async fn set_cache_lazy(
        &self,
        hash: &str,
        fragment_sql: &str,
        original_query: &str,
        partition_key: &str,
    ) -> Result<()> {
        PgBackendCore::guard_lazy_fragment(fragment_sql)?;
        let Some((_, _)) = self.core.get_metadata(partition_key).await? else {
            return Err(ConfigError::Other(format!(
                "partition '{partition_key}' is not registered"
            ))
            .into());
        };
        let cache = self.core.cache_table(partition_key)?;
        let sql = format!(
            "INSERT INTO {cache} (query_hash, partition_keys, partition_keys_count)
             SELECT $1, array_agg(DISTINCT q.{partition_key}), COUNT(DISTINCT q.{partition_key})
             FROM ({fragment_sql}) AS q
             HAVING COUNT(q.{partition_key}) > 0
             ON CONFLICT (query_hash) DO UPDATE SET
                 partition_keys = EXCLUDED.partition_keys,
                 partition_keys_count = EXCLUDED.partition_keys_count"
        );
        sqlx::query(&sql)
            .bind(hash)
            .execute(&self.core.pool)
            .await
            .with_context(|| format!("lazily storing fragment {hash}"))?;
        self.core.set_query(hash, original_query, partition_key).await
    }
}

#[async_trait]
impl SpatialCacheHandler for PostgresArrayCacheHandler {
    async fn get_spatial_filter(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
        buffer_distance: f64,
    ) -> Result<Option<(Vec<u8>, i32)>> {
        let Some(lazy_sql) = self
            .get_spatial_filter_lazy(keys, partition_key, buffer_distance)
            .await?
        else {
            return Ok(None);
        };
        let sql = format!("SELECT ST_AsBinary({lazy_sql}) AS geom");
        let row = sqlx::query(&sql).fetch_one(&self.core.pool).await?;
        let wkb: Option<Vec<u8>> = row.try_get("geom")?;
        Ok(wkb.map(|bytes| (bytes, 4326)))
    }

    async fn get_spatial_filter_lazy(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
        _buffer_distance: f64,
    ) -> Result<Option<String>> {
        let Some((datatype, _)) = self.core.get_metadata(partition_key).await? else {
            return Ok(None);
        };
        if datatype != Datatype::Geometry {
            return Err(ConfigError::SpatialUnsupported(format!(
                "{} partition '{partition_key}' has datatype '{datatype}'",
                self.name()
            ))
            .into());
        }
        let (_, non_null) = self.payload_split(keys, partition_key).await?;
        if non_null.is_empty() {
            return Ok(None);
        }
        let non_null: BTreeSet<String> = non_null.into_iter().collect();
        let cache = self.core.cache_table(partition_key)?;
        let hashes = PgBackendCore::quoted_hash_list(&non_null)?;
        Ok(Some(format!(
            "(SELECT ST_Union(ST_GeomFromWKB(v.value)) FROM (
                 SELECT x.value FROM (
                     SELECT unnest(partition_keys) AS value, query_hash FROM {cache}
                     WHERE query_hash IN ({hashes})
                 ) x GROUP BY x.value HAVING COUNT(DISTINCT x.query_hash) = {n}
             ) v)",
            n = non_null.len()
        )))
    }
}
