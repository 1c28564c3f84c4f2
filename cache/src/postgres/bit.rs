use crate::errors::ConfigError;
use crate::handler::{CacheHandler, LazyCacheHandler, RegisterOptions};
use crate::model::{
    CacheEntry, Datatype, EvictionStrategy, QueryRecord, QueryStatus, Value, ValueSet,
};
use crate::postgres::PgBackendCore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use tracing::debug;

/// Fixed-width bitstring backend, integer partitions only. The payload is a
/// `BIT VARYING` of the partition's declared bitsize; intersections use the
/// `bit_and` aggregate. Rows written under a smaller bitsize are padded at
/// read time, so raising the bitsize never re-packs.
pub struct PostgresBitCacheHandler {
    core: PgBackendCore,
    default_bitsize: i64,
}

const SUPPORTED: &[Datatype] = &[Datatype::Integer];

fn bit_text(positions: &[i64], bitsize: i64) -> String {
    let mut bits = vec![b'0'; bitsize as usize];
    for &position in positions {
        bits[position as usize] = b'1';
    }
    String::from_utf8(bits).expect("bit text is ascii")
}

fn positions_from_bit_text(bits: &str) -> ValueSet {
    bits.chars()
        .enumerate()
        .filter(|(_, c)| *c == '1')
        .map(|(i, _)| Value::Int(i as i64))
        .collect()
}

impl PostgresBitCacheHandler {
    pub fn new(pool: PgPool, table_prefix: &str, default_bitsize: i64) -> Result<Self> {
        Ok(Self {
            core: PgBackendCore::new(pool, table_prefix)?,
            default_bitsize,
        })
    }

    async fn bitsize(&self, partition_key: &str) -> Result<Option<i64>> {
        Ok(self
            .core
            .get_metadata(partition_key)
            .await?
            .and_then(|(_, bitsize)| bitsize))
    }

    fn int_positions(&self, values: &ValueSet, partition_key: &str, bitsize: i64) -> Result<Vec<i64>> {
        let mut positions = Vec::with_capacity(values.len());
        for value in values {
            let Some(v) = value.as_int() else {
                return Err(ConfigError::UnsupportedDatatype {
                    backend: "postgresql_bit",
                    datatype: value.datatype().as_str().to_string(),
                }
                .into());
            };
            if v < 0 || v >= bitsize {
                return Err(ConfigError::BitsizeExceeded {
                    partition_key: partition_key.to_string(),
                    value: v,
                    bitsize,
                }
                .into());
            }
            positions.push(v);
        }
        Ok(positions)
    }

    /// `bit_and` over the selected rows, padded to the current bitsize.
    fn aggregate_sql(&self, cache_table: &str, bitsize: i64, key_clause: &str) -> String {
        format!(
            "SELECT bit_and(rpad(partition_keys::text, {bitsize}, '0')::varbit) AS bits
             FROM {cache_table} WHERE {key_clause} AND partition_keys IS NOT NULL"
        )
    }
}

#[async_trait]
impl CacheHandler for PostgresBitCacheHandler {
    fn name(&self) -> &'static str {
        "postgresql_bit"
    }

    fn supported_datatypes(&self) -> &'static [Datatype] {
        SUPPORTED
    }

    fn lazy(&self) -> Option<&dyn LazyCacheHandler> {
        Some(self)
    }

    async fn setup(&self) -> Result<()> {
        self.core.create_bookkeeping_tables().await
    }

    async fn register_partition_key(
        &self,
        partition_key: &str,
        datatype: Datatype,
        options: &RegisterOptions,
    ) -> Result<()> {
        let bitsize = options.bitsize.unwrap_or(self.default_bitsize);
        self.core
            .register_metadata(partition_key, datatype, Some(bitsize), self.name(), SUPPORTED)
            .await?;
        self.core
            .ensure_cache_table(partition_key, "BIT VARYING")
            .await
    }

    async fn set_cache(&self, hash: &str, values: &ValueSet, partition_key: &str) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        if self.core.get_metadata(partition_key).await?.is_none() {
            self.register_partition_key(partition_key, Datatype::Integer, &RegisterOptions::default())
                .await?;
        }
        let bitsize = self
            .bitsize(partition_key)
            .await?
            .unwrap_or(self.default_bitsize);
        let positions = self.int_positions(values, partition_key, bitsize)?;
        let sql = format!(
            "INSERT INTO {cache} (query_hash, partition_keys, partition_keys_count)
             VALUES ($1, $2::varbit, $3)
             ON CONFLICT (query_hash) DO UPDATE SET
                 partition_keys = EXCLUDED.partition_keys,
                 partition_keys_count = EXCLUDED.partition_keys_count",
            cache = self.core.cache_table(partition_key)?
        );
        sqlx::query(&sql)
            .bind(hash)
            .bind(bit_text(&positions, bitsize))
            .bind(positions.len() as i64)
            .execute(&self.core.pool)
            .await?;
        self.core.touch_query(hash, partition_key).await?;
        debug!(
            "stored {} bits for {hash} in partition '{partition_key}'",
            positions.len()
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
            "SELECT partition_keys::text AS bits FROM {cache} WHERE query_hash = $1",
            cache = self.core.cache_table(partition_key)?
        );
        let row = sqlx::query(&sql)
            .bind(hash)
            .fetch_optional(&self.core.pool)
            .await?;
        if let Some(row) = row {
            let bits: Option<String> = row.try_get("bits")?;
            return Ok(Some(match bits {
                Some(bits) => CacheEntry::Set(positions_from_bit_text(&bits)),
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
        let Some(bitsize) = self.bitsize(partition_key).await? else {
            return Ok((None, 0));
        };
        let rows = self.core.existing_payload_rows(keys, partition_key).await?;
        let hits = rows.len();
        if hits == 0 {
            return Ok((None, 0));
        }
        let non_null: Vec<String> = rows
            .into_iter()
            .filter(|(_, is_null)| !is_null)
            .map(|(hash, _)| hash)
            .collect();
        if non_null.is_empty() {
            return Ok((None, hits));
        }
        let cache_table = self.core.cache_table(partition_key)?;
        let sql = format!(
            "SELECT bit_and(rpad(partition_keys::text, $2, '0')::varbit)::text AS bits
             FROM {cache_table}
             WHERE query_hash = ANY($1) AND partition_keys IS NOT NULL"
        );
        let row = sqlx::query(&sql)
            .bind(&non_null)
            .bind(bitsize as i32)
            .fetch_one(&self.core.pool)
            .await?;
        let bits: Option<String> = row.try_get("bits")?;
        Ok((
            Some(bits.map(|b| positions_from_bit_text(&b)).unwrap_or_default()),
            hits,
        ))
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
impl LazyCacheHandler for PostgresBitCacheHandler {
    async fn get_intersected_lazy(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<(Option<String>, usize)> {
        let Some(bitsize) = self.bitsize(partition_key).await? else {
            return Ok((None, 0));
        };
        let rows = self.core.existing_payload_rows(keys, partition_key).await?;
        let hits = rows.len();
        if hits == 0 {
            return Ok((None, 0));
        }
        let non_null: BTreeSet<String> = rows
            .into_iter()
            .filter(|(_, is_null)| !is_null)
            .map(|(hash, _)| hash)
            .collect();
        if non_null.is_empty() {
            return Ok((None, hits));
        }
        let cache_table = self.core.cache_table(partition_key)?;
        let hashes = PgBackendCore::quoted_hash_list(&non_null)?;
        let aggregate = self.aggregate_sql(
            &cache_table,
            bitsize,
            &format!("query_hash IN ({hashes})"),
        );
        // unpack the AND result into the set of positions carrying a 1
        let sql = format!(
            "(SELECT i.n AS {partition_key}
              FROM ({aggregate}) agg,
              LATERAL generate_series(0, length(agg.bits) - 1) AS i(n)
              WHERE get_bit(agg.bits, i.n) = 1)"
        );
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
        if self.core.get_metadata(partition_key).await?.is_none() {
            self.register_partition_key(partition_key, Datatype::Integer, &RegisterOptions::default())
                .await?;
        }
        let bitsize = self
            .bitsize(partition_key)
            .await?
            .unwrap_or(self.default_bitsize);
        let cache = self.core.cache_table(partition_key)?;
        // build the bit string entirely inside the database; values outside
        // the declared range are dropped rather than silently truncated
        let sql = format!(
            "WITH fragment_result AS ({fragment_sql}),
             positions AS (
                 SELECT DISTINCT {partition_key}::bigint AS p FROM fragment_result
                 WHERE {partition_key}::bigint >= 0 AND {partition_key}::bigint < {bitsize}
             ),
             packed AS (
                 SELECT string_agg(
                            CASE WHEN s.i IN (SELECT p FROM positions) THEN '1' ELSE '0' END,
                            '' ORDER BY s.i
                        ) AS bits,
                        (SELECT COUNT(*) FROM positions) AS cnt
                 FROM generate_series(0, {bitsize} - 1) AS s(i)
             )
             INSERT INTO {cache} (query_hash, partition_keys, partition_keys_count)
             SELECT $1, bits::varbit, cnt FROM packed WHERE cnt > 0
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_text_round_trip() {
        let text = bit_text(&[0, 2, 5], 8);
        assert_eq!(text, "10100100");
        let positions = positions_from_bit_text(&text);
        assert_eq!(
            positions,
            [0, 2, 5].into_iter().map(Value::Int).collect::<ValueSet>()
        );
    }

    #[test]
    fn empty_bit_text() {
        assert_eq!(bit_text(&[], 4), "0000");
        assert!(positions_from_bit_text("0000").is_empty());
    }
}
