use crate::config::QueueEnv;
use crate::model::{FragmentQueueEntry, OriginalQueueEntry, QueueHandler, QueueLengths};
use anyhow::{Context, Result};
use async_trait::async_trait;
use partitioncache_cache::Datatype;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;

/// Redis-backed queues over list commands. Entries travel as JSON; BLPOP
/// provides native blocking pops. Priorities are accepted for interface
/// parity but Redis lists keep plain FIFO order.
pub struct RedisQueueHandler {
    client: redis::Client,
    queue_key: String,
}

impl RedisQueueHandler {
    pub fn connect(env: &QueueEnv) -> Result<Self> {
        let url = env.redis_url()?;
        let queue_key = env
            .redis_queue_key
            .clone()
            .unwrap_or_else(|| "partitioncache_queue".to_string());
        let client = redis::Client::open(url).with_context(|| "opening redis client")?;
        Ok(Self { client, queue_key })
    }

    fn original_key(&self) -> String {
        format!("{}_original_query_queue", self.queue_key)
    }

    fn fragment_key(&self) -> String {
        format!("{}_query_fragment_queue", self.queue_key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// BLPOP needs a connection of its own; a blocked multiplexed
    /// connection would stall every other command sharing it.
    async fn blocking_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl QueueHandler for RedisQueueHandler {
    async fn setup(&self) -> Result<()> {
        // lists are created on first push
        Ok(())
    }

    async fn push_to_original_query_queue_with_priority(
        &self,
        query: &str,
        partition_key: &str,
        datatype: Option<Datatype>,
        _priority: i32,
    ) -> Result<()> {
        let entry = OriginalQueueEntry {
            query: query.to_string(),
            partition_key: partition_key.to_string(),
            datatype,
        };
        let payload = serde_json::to_string(&entry)?;
        let mut conn = self.connection().await?;
        let _: i64 = conn.rpush(self.original_key(), payload).await?;
        debug!("pushed query to the redis original query queue");
        Ok(())
    }

    async fn push_to_query_fragment_queue_with_priority(
        &self,
        pairs: &[(String, String)],
        partition_key: &str,
        datatype: Option<Datatype>,
        cache_backend: Option<&str>,
        _priority: i32,
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut payloads = Vec::with_capacity(pairs.len());
        for (query, hash) in pairs {
            let entry = FragmentQueueEntry {
                query: query.clone(),
                hash: hash.clone(),
                partition_key: partition_key.to_string(),
                datatype,
                cache_backend: cache_backend.map(|s| s.to_string()),
            };
            payloads.push(serde_json::to_string(&entry)?);
        }
        let mut conn = self.connection().await?;
        let _: i64 = conn.rpush(self.fragment_key(), payloads).await?;
        debug!("pushed {} fragments to the redis fragment queue", pairs.len());
        Ok(())
    }

    async fn pop_from_original_query_queue(&self) -> Result<Option<OriginalQueueEntry>> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.lpop(self.original_key(), None).await?;
        Ok(match payload {
            Some(payload) => Some(serde_json::from_str(&payload)?),
            None => None,
        })
    }

    async fn pop_from_original_query_queue_blocking(
        &self,
        timeout: Duration,
    ) -> Result<Option<OriginalQueueEntry>> {
        let mut conn = self.blocking_connection().await?;
        let popped: Option<(String, String)> = conn
            .blpop(self.original_key(), timeout.as_secs_f64())
            .await?;
        Ok(match popped {
            Some((_key, payload)) => Some(serde_json::from_str(&payload)?),
            None => None,
        })
    }

    async fn pop_from_query_fragment_queue(&self) -> Result<Option<FragmentQueueEntry>> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.lpop(self.fragment_key(), None).await?;
        Ok(match payload {
            Some(payload) => Some(serde_json::from_str(&payload)?),
            None => None,
        })
    }

    async fn pop_from_query_fragment_queue_blocking(
        &self,
        timeout: Duration,
    ) -> Result<Option<FragmentQueueEntry>> {
        let mut conn = self.blocking_connection().await?;
        let popped: Option<(String, String)> = conn
            .blpop(self.fragment_key(), timeout.as_secs_f64())
            .await?;
        Ok(match popped {
            Some((_key, payload)) => Some(serde_json::from_str(&payload)?),
            None => None,
        })
    }

    async fn get_queue_lengths(&self) -> Result<QueueLengths> {
        let mut conn = self.connection().await?;
        let original: i64 = conn.llen(self.original_key()).await?;
        let fragments: i64 = conn.llen(self.fragment_key()).await?;
        Ok(QueueLengths {
            original_query_queue: original,
            query_fragment_queue: fragments,
        })
    }

    async fn clear_original_query_queue(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: i64 = conn.llen(self.original_key()).await?;
        let _: () = conn.del(self.original_key()).await?;
        Ok(count as u64)
    }

    async fn clear_query_fragment_queue(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: i64 = conn.llen(self.fragment_key()).await?;
        let _: () = conn.del(self.fragment_key()).await?;
        Ok(count as u64)
    }

    async fn close(&self) {}
}
