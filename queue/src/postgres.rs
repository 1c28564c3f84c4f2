use crate::config::QueueEnv;
use crate::model::{FragmentQueueEntry, OriginalQueueEntry, QueueHandler, QueueLengths};
use anyhow::{Context, Result};
use async_trait::async_trait;
use partitioncache_cache::Datatype;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// PostgreSQL-backed queues. Pops use `FOR UPDATE SKIP LOCKED` plus DELETE
/// inside one transaction, so concurrent workers never observe the same
/// row. Triggers NOTIFY on INSERT and UPDATE so blocking pops wake up on
/// priority bumps as well as new rows.
pub struct PostgresQueueHandler {
    pool: PgPool,
    table_prefix: String,
}

impl PostgresQueueHandler {
    pub async fn connect(env: &QueueEnv) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&env.pg_connection_string()?)
            .await
            .with_context(|| "connecting to the queue database")?;
        Ok(Self {
            pool,
            table_prefix: env.table_prefix.clone(),
        })
    }

    pub fn with_pool(pool: PgPool, table_prefix: &str) -> Self {
        Self {
            pool,
            table_prefix: table_prefix.to_string(),
        }
    }

    fn original_table(&self) -> String {
        format!("{}_original_query_queue", self.table_prefix)
    }

    fn fragment_table(&self) -> String {
        format!("{}_query_fragment_queue", self.table_prefix)
    }

    fn original_channel(&self) -> String {
        format!("{}_original_query_available", self.table_prefix)
    }

    fn fragment_channel(&self) -> String {
        format!("{}_query_fragment_available", self.table_prefix)
    }

    async fn clear_table(&self, table: &str) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        match sqlx::query(&format!("TRUNCATE TABLE {table}"))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(count as u64),
            Err(e) => {
                // TRUNCATE needs table ownership; DELETE works for plain writers
                debug!("TRUNCATE failed ({e}), falling back to DELETE");
                let result = sqlx::query(&format!("DELETE FROM {table}"))
                    .execute(&self.pool)
                    .await?;
                Ok(result.rows_affected())
            }
        }
    }

    /// Blocking pop: immediate attempt, then LISTEN with bounded waits and
    /// defensive re-polls until the timeout elapses.
    async fn blocking_pop<T, F, Fut>(&self, channel: &str, timeout: Duration, pop: F) -> Result<Option<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if let Some(entry) = pop().await? {
            return Ok(Some(entry));
        }

        let start = Instant::now();
        let mut listener = match PgListener::connect_with(&self.pool).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("LISTEN unavailable, falling back to polling: {e}");
                while start.elapsed() < timeout {
                    let slice =
                        Duration::from_secs(1).min(timeout.saturating_sub(start.elapsed()));
                    tokio::time::sleep(slice).await;
                    if let Some(entry) = pop().await? {
                        return Ok(Some(entry));
                    }
                }
                return Ok(None);
            }
        };
        listener.listen(channel).await?;

        while start.elapsed() < timeout {
            let remaining = timeout.saturating_sub(start.elapsed());
            let slice = remaining.min(Duration::from_secs(5));
            match tokio::time::timeout(slice, listener.recv()).await {
                Ok(Ok(_notification)) => {
                    if let Some(entry) = pop().await? {
                        return Ok(Some(entry));
                    }
                }
                Ok(Err(e)) => {
                    warn!("notification stream error, re-polling: {e}");
                    if let Some(entry) = pop().await? {
                        return Ok(Some(entry));
                    }
                }
                Err(_elapsed) => {
                    // defensive poll: a NOTIFY may have been lost
                    if let Some(entry) = pop().await? {
                        return Ok(Some(entry));
                    }
                }
            }
        }
        debug!("blocking pop on {channel} timed out after {timeout:?}");
        Ok(None)
    }
}

fn parse_datatype(raw: Option<String>) -> Option<Datatype> {
    raw.as_deref().and_then(|s| Datatype::from_str(s).ok())
}

#[async_trait]
impl QueueHandler for PostgresQueueHandler {
    async fn setup(&self) -> Result<()> {
        let original = self.original_table();
        let fragment = self.fragment_table();
        let original_channel = self.original_channel();
        let fragment_channel = self.fragment_channel();
        let prefix = &self.table_prefix;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {original} (
                 id SERIAL PRIMARY KEY,
                 query TEXT NOT NULL,
                 partition_key TEXT NOT NULL,
                 partition_datatype TEXT,
                 priority INTEGER NOT NULL DEFAULT 1,
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                 updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                 UNIQUE (query, partition_key)
             );
             CREATE TABLE IF NOT EXISTS {fragment} (
                 id SERIAL PRIMARY KEY,
                 query TEXT NOT NULL,
                 hash TEXT NOT NULL,
                 partition_key TEXT NOT NULL,
                 partition_datatype TEXT,
                 cache_backend TEXT,
                 priority INTEGER NOT NULL DEFAULT 1,
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                 updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                 UNIQUE (hash, partition_key)
             );
             CREATE OR REPLACE FUNCTION {prefix}_notify_original_query()
             RETURNS TRIGGER AS $$
             BEGIN
                 PERFORM pg_notify('{original_channel}', '');
                 RETURN NEW;
             END;
             $$ LANGUAGE plpgsql;
             CREATE OR REPLACE FUNCTION {prefix}_notify_query_fragment()
             RETURNS TRIGGER AS $$
             BEGIN
                 PERFORM pg_notify('{fragment_channel}', '');
                 RETURN NEW;
             END;
             $$ LANGUAGE plpgsql;
             CREATE OR REPLACE TRIGGER {prefix}_original_insert_notify
                 AFTER INSERT ON {original}
                 FOR EACH ROW EXECUTE FUNCTION {prefix}_notify_original_query();
             CREATE OR REPLACE TRIGGER {prefix}_original_update_notify
                 AFTER UPDATE ON {original}
                 FOR EACH ROW EXECUTE FUNCTION {prefix}_notify_original_query();
             CREATE OR REPLACE TRIGGER {prefix}_fragment_insert_notify
                 AFTER INSERT ON {fragment}
                 FOR EACH ROW EXECUTE FUNCTION {prefix}_notify_query_fragment();
             CREATE OR REPLACE TRIGGER {prefix}_fragment_update_notify
                 AFTER UPDATE ON {fragment}
                 FOR EACH ROW EXECUTE FUNCTION {prefix}_notify_query_fragment();
             CREATE INDEX IF NOT EXISTS idx_{original}_priority
                 ON {original} (priority DESC, created_at ASC);
             CREATE INDEX IF NOT EXISTS idx_{fragment}_priority
                 ON {fragment} (priority DESC, created_at ASC);
             CREATE INDEX IF NOT EXISTS idx_{original}_partition_key
                 ON {original} (partition_key);
             CREATE INDEX IF NOT EXISTS idx_{fragment}_partition_key
                 ON {fragment} (partition_key);"
        );
        sqlx::raw_sql(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| "creating queue tables and triggers")?;
        info!("queue tables {original} and {fragment} ready");
        Ok(())
    }

    async fn push_to_original_query_queue_with_priority(
        &self,
        query: &str,
        partition_key: &str,
        datatype: Option<Datatype>,
        priority: i32,
    ) -> Result<()> {
        let table = self.original_table();
        let sql = format!(
            "INSERT INTO {table} (query, partition_key, partition_datatype, priority)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (query, partition_key) DO UPDATE SET
                 priority = {table}.priority + 1,
                 updated_at = now()"
        );
        sqlx::query(&sql)
            .bind(query)
            .bind(partition_key)
            .bind(datatype.map(|d| d.as_str()))
            .bind(priority)
            .execute(&self.pool)
            .await
            .with_context(|| "pushing to the original query queue")?;
        Ok(())
    }

    async fn push_to_query_fragment_queue_with_priority(
        &self,
        pairs: &[(String, String)],
        partition_key: &str,
        datatype: Option<Datatype>,
        cache_backend: Option<&str>,
        priority: i32,
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let table = self.fragment_table();
        let sql = format!(
            "INSERT INTO {table} (query, hash, partition_key, partition_datatype,
                                  cache_backend, priority)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (hash, partition_key) DO UPDATE SET
                 priority = {table}.priority + $6,
                 updated_at = now()"
        );
        let mut tx = self.pool.begin().await?;
        for (query, hash) in pairs {
            sqlx::query(&sql)
                .bind(query)
                .bind(hash)
                .bind(partition_key)
                .bind(datatype.map(|d| d.as_str()))
                .bind(cache_backend)
                .bind(priority)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit()
            .await
            .with_context(|| "pushing to the query fragment queue")?;
        debug!("pushed {} fragments to the fragment queue", pairs.len());
        Ok(())
    }

    async fn pop_from_original_query_queue(&self) -> Result<Option<OriginalQueueEntry>> {
        let table = self.original_table();
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT id, query, partition_key, partition_datatype FROM {table}
             ORDER BY priority DESC, created_at ASC
             LIMIT 1 FOR UPDATE SKIP LOCKED"
        );
        let Some(row) = sqlx::query(&sql).fetch_optional(&mut *tx).await? else {
            return Ok(None);
        };
        let id: i32 = row.try_get("id")?;
        let entry = OriginalQueueEntry {
            query: row.try_get("query")?,
            partition_key: row.try_get("partition_key")?,
            datatype: parse_datatype(row.try_get("partition_datatype")?),
        };
        sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(entry))
    }

    async fn pop_from_original_query_queue_blocking(
        &self,
        timeout: Duration,
    ) -> Result<Option<OriginalQueueEntry>> {
        let channel = self.original_channel();
        self.blocking_pop(&channel, timeout, || self.pop_from_original_query_queue())
            .await
    }

    async fn pop_from_query_fragment_queue(&self) -> Result<Option<FragmentQueueEntry>> {
        let table = self.fragment_table();
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT id, query, hash, partition_key, partition_datatype, cache_backend
             FROM {table}
             ORDER BY priority DESC, created_at ASC
             LIMIT 1 FOR UPDATE SKIP LOCKED"
        );
        let Some(row) = sqlx::query(&sql).fetch_optional(&mut *tx).await? else {
            return Ok(None);
        };
        let id: i32 = row.try_get("id")?;
        let entry = FragmentQueueEntry {
            query: row.try_get("query")?,
            hash: row.try_get("hash")?,
            partition_key: row.try_get("partition_key")?,
            datatype: parse_datatype(row.try_get("partition_datatype")?),
            cache_backend: row.try_get("cache_backend")?,
        };
        sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(entry))
    }

    async fn pop_from_query_fragment_queue_blocking(
        &self,
        timeout: Duration,
    ) -> Result<Option<FragmentQueueEntry>> {
        let channel = self.fragment_channel();
        self.blocking_pop(&channel, timeout, || self.pop_from_query_fragment_queue())
            .await
    }

    async fn get_queue_lengths(&self) -> Result<QueueLengths> {
        let row = sqlx::query(&format!(
            "SELECT (SELECT COUNT(*) FROM {}) AS original,
                    (SELECT COUNT(*) FROM {}) AS fragments",
            self.original_table(),
            self.fragment_table()
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueLengths {
            original_query_queue: row.try_get("original")?,
            query_fragment_queue: row.try_get("fragments")?,
        })
    }

    async fn clear_original_query_queue(&self) -> Result<u64> {
        self.clear_table(&self.original_table()).await
    }

    async fn clear_query_fragment_queue(&self) -> Result<u64> {
        self.clear_table(&self.fragment_table()).await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
