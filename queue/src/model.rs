use anyhow::Result;
use async_trait::async_trait;
use partitioncache_cache::Datatype;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An original user query waiting to be fragmented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalQueueEntry {
    pub query: String,
    pub partition_key: String,
    pub datatype: Option<Datatype>,
}

/// A fragment waiting to be evaluated against the DBMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentQueueEntry {
    pub query: String,
    pub hash: String,
    pub partition_key: String,
    pub datatype: Option<Datatype>,
    /// Overrides the processor's configured backend for this fragment
    pub cache_backend: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLengths {
    pub original_query_queue: i64,
    pub query_fragment_queue: i64,
}

/// Provider interface for the two fill-pipeline queues.
///
/// Pops are atomic: a popped entry is observed by exactly one consumer.
/// Blocking pops return `None` on timeout, never an error.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn setup(&self) -> Result<()>;

    async fn push_to_original_query_queue(
        &self,
        query: &str,
        partition_key: &str,
        datatype: Option<Datatype>,
    ) -> Result<()> {
        self.push_to_original_query_queue_with_priority(query, partition_key, datatype, 1)
            .await
    }

    async fn push_to_original_query_queue_with_priority(
        &self,
        query: &str,
        partition_key: &str,
        datatype: Option<Datatype>,
        priority: i32,
    ) -> Result<()>;

    async fn push_to_query_fragment_queue(
        &self,
        pairs: &[(String, String)],
        partition_key: &str,
        datatype: Option<Datatype>,
        cache_backend: Option<&str>,
    ) -> Result<()> {
        self.push_to_query_fragment_queue_with_priority(
            pairs,
            partition_key,
            datatype,
            cache_backend,
            1,
        )
        .await
    }

    /// Batch-push `(fragment_sql, hash)` pairs.
    async fn push_to_query_fragment_queue_with_priority(
        &self,
        pairs: &[(String, String)],
        partition_key: &str,
        datatype: Option<Datatype>,
        cache_backend: Option<&str>,
        priority: i32,
    ) -> Result<()>;

    async fn pop_from_original_query_queue(&self) -> Result<Option<OriginalQueueEntry>>;

    async fn pop_from_original_query_queue_blocking(
        &self,
        timeout: Duration,
    ) -> Result<Option<OriginalQueueEntry>>;

    async fn pop_from_query_fragment_queue(&self) -> Result<Option<FragmentQueueEntry>>;

    async fn pop_from_query_fragment_queue_blocking(
        &self,
        timeout: Duration,
    ) -> Result<Option<FragmentQueueEntry>>;

    async fn get_queue_lengths(&self) -> Result<QueueLengths>;

    async fn clear_original_query_queue(&self) -> Result<u64>;

    async fn clear_query_fragment_queue(&self) -> Result<u64>;

    async fn clear_all_queues(&self) -> Result<(u64, u64)> {
        let original = self.clear_original_query_queue().await?;
        let fragments = self.clear_query_fragment_queue().await?;
        Ok((original, fragments))
    }

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_entries_serialize_round_trip() {
        let entry = FragmentQueueEntry {
            query: "SELECT DISTINCT t1.trip_id FROM trips AS t1".to_string(),
            hash: "f7c3bc1d808e04732adf679965ccc34ca7ae3441".to_string(),
            partition_key: "trip_id".to_string(),
            datatype: Some(Datatype::Integer),
            cache_backend: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        let restored: FragmentQueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, entry);
    }
}
