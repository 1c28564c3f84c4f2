use crate::errors::ConfigError;
use crate::handler::{CacheHandler, RegisterOptions};
use crate::model::{
    CacheEntry, Datatype, EvictionStrategy, QueryRecord, QueryStatus, Value, ValueSet,
};
use crate::postgres::PgBackendCore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use roaring::RoaringBitmap;
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use tracing::debug;

/// Compressed-bitmap backend: integer partitions without a fixed ceiling.
/// Payloads are serialized roaring bitmaps in a BYTEA column; intersections
/// happen client-side with bitmap AND, so no lazy capability.
pub struct PostgresRoaringCacheHandler {
    core: PgBackendCore,
}

const SUPPORTED: &[Datatype] = &[Datatype::Integer];

fn to_bitmap(values: &ValueSet) -> Result<RoaringBitmap> {
    let mut bitmap = RoaringBitmap::new();
    for value in values {
        let Some(v) = value.as_int() else {
            return Err(ConfigError::UnsupportedDatatype {
                backend: "postgresql_roaringbit",
                datatype: value.datatype().as_str().to_string(),
            }
            .into());
        };
        let v = u32::try_from(v).map_err(|_| ConfigError::Other(
            format!("value {v} does not fit the 32-bit roaring bitmap domain"),
        ))?;
        bitmap.insert(v);
    }
    Ok(bitmap)
}

fn serialize_bitmap(bitmap: &RoaringBitmap) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(bitmap.serialized_size());
    bitmap
        .serialize_into(&mut buffer)
        .with_context(|| "serializing roaring bitmap")?;
    Ok(buffer)
}

fn deserialize_bitmap(buffer: &[u8]) -> Result<RoaringBitmap> {
    RoaringBitmap::deserialize_from(buffer).with_context(|| "deserializing roaring bitmap")
}

fn bitmap_to_set(bitmap: &RoaringBitmap) -> ValueSet {
    bitmap.iter().map(|v| Value::Int(v as i64)).collect()
}

impl PostgresRoaringCacheHandler {
    pub fn new(pool: PgPool, table_prefix: &str) -> Result<Self> {
        Ok(Self {
            core: PgBackendCore::new(pool, table_prefix)?,
        })
    }
}

#[async_trait]
impl CacheHandler for PostgresRoaringCacheHandler {
    fn name(&self) -> &'static str {
        "postgresql_roaringbit"
    }

    fn supported_datatypes(&self) -> &'static [Datatype] {
        SUPPORTED
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
        self.core.ensure_cache_table(partition_key, "BYTEA").await
    }

    async fn set_cache(&self, hash: &str, values: &ValueSet, partition_key: &str) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        if self.core.get_metadata(partition_key).await?.is_none() {
            self.register_partition_key(partition_key, Datatype::Integer, &RegisterOptions::default())
                .await?;
        }
        let bitmap = to_bitmap(values)?;
        let sql = format!(
            "INSERT INTO {cache} (query_hash, partition_keys, partition_keys_count)
             VALUES ($1, $2, $3)
             ON CONFLICT (query_hash) DO UPDATE SET
                 partition_keys = EXCLUDED.partition_keys,
                 partition_keys_count = EXCLUDED.partition_keys_count",
            cache = self.core.cache_table(partition_key)?
        );
        sqlx::query(&sql)
            .bind(hash)
            .bind(serialize_bitmap(&bitmap)?)
            .bind(bitmap.len() as i64)
            .execute(&self.core.pool)
            .await?;
        self.core.touch_query(hash, partition_key).await?;
        debug!(
            "stored bitmap of {} values for {hash} in partition '{partition_key}'",
            bitmap.len()
        );
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
        if self.core.get_metadata(partition_key).await?.is_none() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT partition_keys FROM {cache} WHERE query_hash = $1",
            cache = self.core.cache_table(partition_key)?
        );
        let row = sqlx::query(&sql)
            .bind(hash)
            .fetch_optional(&self.core.pool)
            .await?;
        if let Some(row) = row {
            let payload: Option<Vec<u8>> = row.try_get("partition_keys")?;
            return Ok(Some(match payload {
                Some(buffer) => CacheEntry::Set(bitmap_to_set(&deserialize_bitmap(&buffer)?)),
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
        if keys.is_empty() || self.core.get_metadata(partition_key).await?.is_none() {
            return Ok((None, 0));
        }
        let key_list: Vec<String> = keys.iter().cloned().collect();
        let sql = format!(
            "SELECT partition_keys FROM {cache} WHERE query_hash = ANY($1)",
            cache = self.core.cache_table(partition_key)?
        );
        let rows = sqlx::query(&sql)
            .bind(&key_list)
            .fetch_all(&self.core.pool)
            .await?;
        let hits = rows.len();
        if hits == 0 {
            return Ok((None, 0));
        }
        let mut intersection: Option<RoaringBitmap> = None;
        for row in rows {
            let payload: Option<Vec<u8>> = row.try_get("partition_keys")?;
            // NULL sentinels are identity elements of the intersection
            if let Some(buffer) = payload {
                let bitmap = deserialize_bitmap(&buffer)?;
                intersection = Some(match intersection {
                    None => bitmap,
                    Some(current) => current & bitmap,
                });
            }
        }
        Ok((intersection.map(|b| bitmap_to_set(&b)), hits))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::int_set;

    #[test]
    fn bitmap_round_trip() {
        let bitmap = to_bitmap(&int_set([1, 2, 3, 1_000_000])).unwrap();
        let buffer = serialize_bitmap(&bitmap).unwrap();
        let restored = deserialize_bitmap(&buffer).unwrap();
        assert_eq!(bitmap_to_set(&restored), int_set([1, 2, 3, 1_000_000]));
    }

    #[test]
    fn bitmap_intersection() {
        let a = to_bitmap(&int_set([1, 2, 3])).unwrap();
        let b = to_bitmap(&int_set([2, 3, 4])).unwrap();
        let c = to_bitmap(&int_set([3, 4, 5])).unwrap();
        assert_eq!(bitmap_to_set(&(a & b & c)), int_set([3]));
    }

    #[test]
    fn negative_values_are_rejected() {
        assert!(to_bitmap(&int_set([-1])).is_err());
    }
}
