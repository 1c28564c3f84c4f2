//! PostgreSQL-resident cache backends.
//!
//! All backends share the bookkeeping schema:
//! `<prefix>_partition_metadata`, `<prefix>_queries` and one
//! `<prefix>_cache_<partition_key>` payload table per partition. Identifiers
//! are validated before being spliced into SQL text; values always travel as
//! bound parameters.

pub mod array;
pub mod bit;
pub mod roaring;

use crate::errors::ConfigError;
use crate::identifiers::{validate_hash, validate_identifier};
use crate::model::{Datatype, EvictionStrategy, QueryRecord, QueryStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::debug;

/// Shared state and bookkeeping operations of the SQL-resident backends.
pub struct PgBackendCore {
    pub pool: PgPool,
    pub table_prefix: String,
}

impl PgBackendCore {
    pub fn new(pool: PgPool, table_prefix: &str) -> Result<Self> {
        validate_identifier(table_prefix, "table prefix")?;
        Ok(Self {
            pool,
            table_prefix: table_prefix.to_string(),
        })
    }

    pub fn metadata_table(&self) -> String {
        format!("{}_partition_metadata", self.table_prefix)
    }

    pub fn queries_table(&self) -> String {
        format!("{}_queries", self.table_prefix)
    }

    pub fn cache_table(&self, partition_key: &str) -> Result<String> {
        validate_identifier(partition_key, "partition key")?;
        Ok(format!("{}_cache_{partition_key}", self.table_prefix))
    }

    /// Quote a set of hashes for direct inclusion in lazy SQL text. Hashes
    /// are validated to be hex before quoting.
    pub fn quoted_hash_list(keys: &BTreeSet<String>) -> Result<String> {
        let mut quoted = Vec::with_capacity(keys.len());
        for key in keys {
            validate_hash(key)?;
            quoted.push(format!("'{key}'"));
        }
        Ok(quoted.join(", "))
    }

    pub async fn create_bookkeeping_tables(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {metadata} (
                 partition_key TEXT PRIMARY KEY,
                 datatype TEXT NOT NULL,
                 bitsize BIGINT,
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now()
             );
             CREATE TABLE IF NOT EXISTS {queries} (
                 query_hash TEXT NOT NULL,
                 query TEXT NOT NULL DEFAULT '',
                 partition_key TEXT NOT NULL,
                 status TEXT NOT NULL DEFAULT 'ok'
                     CHECK (status IN ('ok', 'timeout', 'failed')),
                 last_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
                 PRIMARY KEY (query_hash, partition_key)
             );",
            metadata = self.metadata_table(),
            queries = self.queries_table(),
        );
        sqlx::raw_sql(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| "creating cache bookkeeping tables")?;
        debug!("cache bookkeeping tables ready (prefix {})", self.table_prefix);
        Ok(())
    }

    pub async fn ensure_cache_table(&self, partition_key: &str, payload_type: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {cache} (
                 query_hash TEXT PRIMARY KEY,
                 partition_keys {payload_type},
                 partition_keys_count BIGINT,
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now()
             );",
            cache = self.cache_table(partition_key)?,
        );
        sqlx::raw_sql(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating cache table for partition '{partition_key}'"))?;
        Ok(())
    }

    pub async fn get_metadata(&self, partition_key: &str) -> Result<Option<(Datatype, Option<i64>)>> {
        let sql = format!(
            "SELECT datatype, bitsize FROM {} WHERE partition_key = $1",
            self.metadata_table()
        );
        let row = sqlx::query(&sql)
            .bind(partition_key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let datatype: String = row.try_get("datatype")?;
                let bitsize: Option<i64> = row.try_get("bitsize")?;
                Ok(Some((Datatype::from_str(&datatype)?, bitsize)))
            }
            None => Ok(None),
        }
    }

    /// Insert or verify the partition metadata row. The datatype is
    /// write-once; the bitsize may only grow.
    pub async fn register_metadata(
        &self,
        partition_key: &str,
        datatype: Datatype,
        bitsize: Option<i64>,
        backend: &'static str,
        supported: &'static [Datatype],
    ) -> Result<()> {
        validate_identifier(partition_key, "partition key")?;
        if !supported.contains(&datatype) {
            return Err(ConfigError::UnsupportedDatatype {
                backend,
                datatype: datatype.as_str().to_string(),
            }
            .into());
        }
        if let Some((existing, existing_bitsize)) = self.get_metadata(partition_key).await? {
            if existing != datatype {
                return Err(ConfigError::DatatypeMismatch {
                    partition_key: partition_key.to_string(),
                    existing: existing.as_str().to_string(),
                    requested: datatype.as_str().to_string(),
                }
                .into());
            }
            // bitsize is monotonically non-decreasing; existing rows are not
            // re-packed, reads pad to the new width
            if let (Some(requested), Some(current)) = (bitsize, existing_bitsize) {
                if requested > current {
                    let sql = format!(
                        "UPDATE {} SET bitsize = $1 WHERE partition_key = $2",
                        self.metadata_table()
                    );
                    sqlx::query(&sql)
                        .bind(requested)
                        .bind(partition_key)
                        .execute(&self.pool)
                        .await?;
                }
            }
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (partition_key, datatype, bitsize) VALUES ($1, $2, $3)
             ON CONFLICT (partition_key) DO NOTHING",
            self.metadata_table()
        );
        sqlx::query(&sql)
            .bind(partition_key)
            .bind(datatype.as_str())
            .bind(bitsize)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Refresh `last_seen` for a hash, creating a minimal query row if none
    /// exists yet.
    pub async fn touch_query(&self, hash: &str, partition_key: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (query_hash, partition_key, query) VALUES ($1, $2, '')
             ON CONFLICT (query_hash, partition_key) DO UPDATE SET last_seen = now()",
            self.queries_table()
        );
        sqlx::query(&sql)
            .bind(hash)
            .bind(partition_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_query(&self, hash: &str, query_text: &str, partition_key: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (query_hash, partition_key, query) VALUES ($1, $2, $3)
             ON CONFLICT (query_hash, partition_key)
             DO UPDATE SET query = EXCLUDED.query, last_seen = now()",
            self.queries_table()
        );
        sqlx::query(&sql)
            .bind(hash)
            .bind(partition_key)
            .bind(query_text)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_query_status(
        &self,
        hash: &str,
        partition_key: &str,
        status: QueryStatus,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (query_hash, partition_key, query, status) VALUES ($1, $2, '', $3)
             ON CONFLICT (query_hash, partition_key)
             DO UPDATE SET status = EXCLUDED.status, last_seen = now()",
            self.queries_table()
        );
        sqlx::query(&sql)
            .bind(hash)
            .bind(partition_key)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_query_status(
        &self,
        hash: &str,
        partition_key: &str,
    ) -> Result<Option<QueryStatus>> {
        let sql = format!(
            "SELECT status FROM {} WHERE query_hash = $1 AND partition_key = $2",
            self.queries_table()
        );
        let row = sqlx::query(&sql)
            .bind(hash)
            .bind(partition_key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                Ok(Some(QueryStatus::from_str(&status)?))
            }
            None => Ok(None),
        }
    }

    pub async fn get_query(&self, hash: &str, partition_key: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT query FROM {} WHERE query_hash = $1 AND partition_key = $2",
            self.queries_table()
        );
        let row = sqlx::query(&sql)
            .bind(hash)
            .bind(partition_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("query")?),
            None => None,
        })
    }

    pub async fn get_all_queries(&self, partition_key: &str) -> Result<Vec<QueryRecord>> {
        let sql = format!(
            "SELECT query_hash, query, status, last_seen FROM {}
             WHERE partition_key = $1 ORDER BY last_seen DESC",
            self.queries_table()
        );
        let rows = sqlx::query(&sql)
            .bind(partition_key)
            .fetch_all(&self.pool)
            .await?;
        let mut records = vec![];
        for row in rows {
            let status: String = row.try_get("status")?;
            let last_seen: DateTime<Utc> = row.try_get("last_seen")?;
            records.push(QueryRecord {
                hash: row.try_get("query_hash")?,
                query: row.try_get("query")?,
                partition_key: partition_key.to_string(),
                status: QueryStatus::from_str(&status)?,
                last_seen,
            });
        }
        Ok(records)
    }

    pub async fn payload_exists(&self, hash: &str, partition_key: &str) -> Result<bool> {
        if self.get_metadata(partition_key).await?.is_none() {
            return Ok(false);
        }
        let sql = format!(
            "SELECT 1 AS present FROM {} WHERE query_hash = $1",
            self.cache_table(partition_key)?
        );
        Ok(sqlx::query(&sql)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    pub async fn exists(&self, hash: &str, partition_key: &str, check_query: bool) -> Result<bool> {
        if self.payload_exists(hash, partition_key).await? {
            return Ok(true);
        }
        if check_query {
            if let Some(status) = self.get_query_status(hash, partition_key).await? {
                return Ok(status.is_tombstone());
            }
        }
        Ok(false)
    }

    pub async fn filter_existing_keys(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<BTreeSet<String>> {
        if keys.is_empty() || self.get_metadata(partition_key).await?.is_none() {
            return Ok(BTreeSet::new());
        }
        let key_list: Vec<String> = keys.iter().cloned().collect();
        let sql = format!(
            "SELECT query_hash FROM {} WHERE query_hash = ANY($1)",
            self.cache_table(partition_key)?
        );
        let rows = sqlx::query(&sql).bind(&key_list).fetch_all(&self.pool).await?;
        let mut existing = BTreeSet::new();
        for row in rows {
            existing.insert(row.try_get::<String, _>("query_hash")?);
        }
        Ok(existing)
    }

    /// Payload rows among `keys` and whether each is the NULL sentinel.
    pub async fn existing_payload_rows(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<Vec<(String, bool)>> {
        if keys.is_empty() || self.get_metadata(partition_key).await?.is_none() {
            return Ok(vec![]);
        }
        let key_list: Vec<String> = keys.iter().cloned().collect();
        let sql = format!(
            "SELECT query_hash, partition_keys IS NULL AS is_null FROM {}
             WHERE query_hash = ANY($1) ORDER BY query_hash",
            self.cache_table(partition_key)?
        );
        let rows = sqlx::query(&sql).bind(&key_list).fetch_all(&self.pool).await?;
        let mut result = vec![];
        for row in rows {
            result.push((row.try_get("query_hash")?, row.try_get("is_null")?));
        }
        Ok(result)
    }

    pub async fn get_all_keys(&self, partition_key: &str) -> Result<Vec<String>> {
        if self.get_metadata(partition_key).await?.is_none() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT query_hash FROM {} ORDER BY created_at DESC",
            self.cache_table(partition_key)?
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("query_hash").map_err(Into::into))
            .collect()
    }

    pub async fn delete_entry(&self, hash: &str, partition_key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "DELETE FROM {} WHERE query_hash = $1",
            self.cache_table(partition_key)?
        );
        sqlx::query(&sql).bind(hash).execute(&mut *tx).await?;
        let sql = format!(
            "DELETE FROM {} WHERE query_hash = $1 AND partition_key = $2",
            self.queries_table()
        );
        sqlx::query(&sql)
            .bind(hash)
            .bind(partition_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_partition(&self, partition_key: &str) -> Result<()> {
        let cache_table = self.cache_table(partition_key)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {cache_table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE partition_key = $1",
            self.queries_table()
        ))
        .bind(partition_key)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE partition_key = $1",
            self.metadata_table()
        ))
        .bind(partition_key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_partition_keys(&self) -> Result<Vec<(String, Datatype)>> {
        let sql = format!(
            "SELECT partition_key, datatype FROM {} ORDER BY partition_key",
            self.metadata_table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut partitions = vec![];
        for row in rows {
            let datatype: String = row.try_get("datatype")?;
            partitions.push((row.try_get("partition_key")?, Datatype::from_str(&datatype)?));
        }
        Ok(partitions)
    }

    pub async fn entry_count(&self, partition_key: &str) -> Result<i64> {
        if self.get_metadata(partition_key).await?.is_none() {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) AS n FROM {}", self.cache_table(partition_key)?);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    /// Remove queries last seen more than `days` days ago, and their
    /// payloads, atomically per partition.
    pub async fn prune_old_queries(&self, days: i64) -> Result<u64> {
        let mut total = 0u64;
        for (partition_key, _) in self.get_partition_keys().await? {
            let cache_table = self.cache_table(&partition_key)?;
            let mut tx = self.pool.begin().await?;
            let sql = format!(
                "DELETE FROM {} WHERE partition_key = $1
                 AND last_seen < now() - make_interval(days => $2)
                 RETURNING query_hash",
                self.queries_table()
            );
            let rows = sqlx::query(&sql)
                .bind(&partition_key)
                .bind(days as i32)
                .fetch_all(&mut *tx)
                .await?;
            let stale: Vec<String> = rows
                .into_iter()
                .map(|row| row.try_get::<String, _>("query_hash"))
                .collect::<Result<_, _>>()?;
            if !stale.is_empty() {
                let sql = format!("DELETE FROM {cache_table} WHERE query_hash = ANY($1)");
                sqlx::query(&sql).bind(&stale).execute(&mut *tx).await?;
            }
            tx.commit().await?;
            total += stale.len() as u64;
        }
        Ok(total)
    }

    /// Shrink the partition to at most `threshold` entries, removing from
    /// both the payload table and the queries table atomically.
    pub async fn evict(
        &self,
        partition_key: &str,
        strategy: EvictionStrategy,
        threshold: i64,
    ) -> Result<u64> {
        if self.get_metadata(partition_key).await?.is_none() {
            return Ok(0);
        }
        let cache_table = self.cache_table(partition_key)?;
        let queries_table = self.queries_table();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {cache_table}"))
            .fetch_one(&mut *tx)
            .await?;
        let count: i64 = row.try_get("n")?;
        let excess = count - threshold;
        if excess <= 0 {
            return Ok(0);
        }
        let order = match strategy {
            EvictionStrategy::Oldest => "q.last_seen ASC",
            EvictionStrategy::Largest => "c.partition_keys_count DESC",
        };
        let sql = format!(
            "DELETE FROM {cache_table} WHERE query_hash IN (
                 SELECT c.query_hash FROM {cache_table} c
                 LEFT JOIN {queries_table} q
                     ON q.query_hash = c.query_hash AND q.partition_key = $1
                 ORDER BY {order} LIMIT $2
             ) RETURNING query_hash"
        );
        let rows = sqlx::query(&sql)
            .bind(partition_key)
            .bind(excess)
            .fetch_all(&mut *tx)
            .await?;
        let removed: Vec<String> = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("query_hash"))
            .collect::<Result<_, _>>()?;
        if !removed.is_empty() {
            let sql = format!(
                "DELETE FROM {queries_table} WHERE partition_key = $1 AND query_hash = ANY($2)"
            );
            sqlx::query(&sql)
                .bind(partition_key)
                .bind(&removed)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(removed.len() as u64)
    }

    pub async fn remove_tombstones(&self, partition_key: &str) -> Result<u64> {
        if self.get_metadata(partition_key).await?.is_none() {
            return Ok(0);
        }
        let cache_table = self.cache_table(partition_key)?;
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "DELETE FROM {} WHERE partition_key = $1 AND status IN ('timeout', 'failed')
             RETURNING query_hash",
            self.queries_table()
        );
        let rows = sqlx::query(&sql)
            .bind(partition_key)
            .fetch_all(&mut *tx)
            .await?;
        let removed: Vec<String> = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("query_hash"))
            .collect::<Result<_, _>>()?;
        if !removed.is_empty() {
            let sql = format!("DELETE FROM {cache_table} WHERE query_hash = ANY($1)");
            sqlx::query(&sql).bind(&removed).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(removed.len() as u64)
    }

    pub async fn remove_large_entries(&self, partition_key: &str, max_count: i64) -> Result<u64> {
        if self.get_metadata(partition_key).await?.is_none() {
            return Ok(0);
        }
        let cache_table = self.cache_table(partition_key)?;
        let mut tx = self.pool.begin().await?;
        let sql =
            format!("DELETE FROM {cache_table} WHERE partition_keys_count > $1 RETURNING query_hash");
        let rows = sqlx::query(&sql).bind(max_count).fetch_all(&mut *tx).await?;
        let removed: Vec<String> = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("query_hash"))
            .collect::<Result<_, _>>()?;
        if !removed.is_empty() {
            let sql = format!(
                "DELETE FROM {} WHERE partition_key = $1 AND query_hash = ANY($2)",
                self.queries_table()
            );
            sqlx::query(&sql)
                .bind(partition_key)
                .bind(&removed)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(removed.len() as u64)
    }

    /// Reject fragment SQL that must never reach lazy INSERT ... SELECT.
    pub fn guard_lazy_fragment(fragment_sql: &str) -> Result<()> {
        let upper = fragment_sql.to_uppercase();
        if fragment_sql.contains(';') || upper.contains("DELETE ") || upper.contains("DROP ") {
            return Err(ConfigError::Other(
                "fragment sql contains forbidden statements".to_string(),
            )
            .into());
        }
        Ok(())
    }
}
