use crate::handler::{CacheHandler, RegisterOptions};
use crate::model::{
    CacheEntry, Datatype, EvictionStrategy, QueryRecord, QueryStatus, ValueSet,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

use crate::errors::ConfigError;

/// In-process cache backend. Full core capability over the language's
/// natural set type; no lazy SQL since it is not co-located with any DBMS.
#[derive(Default)]
pub struct MemoryCacheHandler {
    entries: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
    queries: RwLock<HashMap<(String, String), QueryRecord>>,
    metadata: RwLock<HashMap<String, Datatype>>,
}

impl MemoryCacheHandler {
    pub fn new() -> Self {
        Self::default()
    }

    async fn touch_query(&self, hash: &str, partition_key: &str) {
        let mut queries = self.queries.write().await;
        let key = (partition_key.to_string(), hash.to_string());
        queries
            .entry(key)
            .and_modify(|record| record.last_seen = Utc::now())
            .or_insert_with(|| QueryRecord {
                hash: hash.to_string(),
                query: String::new(),
                partition_key: partition_key.to_string(),
                status: QueryStatus::Ok,
                last_seen: Utc::now(),
            });
    }
}

#[async_trait]
impl CacheHandler for MemoryCacheHandler {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supported_datatypes(&self) -> &'static [Datatype] {
        &[
            Datatype::Integer,
            Datatype::Float,
            Datatype::Text,
            Datatype::Timestamp,
            Datatype::Geometry,
        ]
    }

    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn register_partition_key(
        &self,
        partition_key: &str,
        datatype: Datatype,
        _options: &RegisterOptions,
    ) -> Result<()> {
        let mut metadata = self.metadata.write().await;
        if let Some(existing) = metadata.get(partition_key) {
            if *existing != datatype {
                return Err(ConfigError::DatatypeMismatch {
                    partition_key: partition_key.to_string(),
                    existing: existing.as_str().to_string(),
                    requested: datatype.as_str().to_string(),
                }
                .into());
            }
            return Ok(());
        }
        metadata.insert(partition_key.to_string(), datatype);
        Ok(())
    }

    async fn set_cache(&self, hash: &str, values: &ValueSet, partition_key: &str) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.entries
            .write()
            .await
            .entry(partition_key.to_string())
            .or_default()
            .insert(hash.to_string(), CacheEntry::Set(values.clone()));
        self.touch_query(hash, partition_key).await;
        Ok(())
    }

    async fn set_null(&self, hash: &str, partition_key: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .entry(partition_key.to_string())
            .or_default()
            .insert(hash.to_string(), CacheEntry::Null);
        self.touch_query(hash, partition_key).await;
        Ok(())
    }

    async fn set_query(&self, hash: &str, query_text: &str, partition_key: &str) -> Result<()> {
        let mut queries = self.queries.write().await;
        let key = (partition_key.to_string(), hash.to_string());
        queries
            .entry(key)
            .and_modify(|record| {
                record.query = query_text.to_string();
                record.last_seen = Utc::now();
            })
            .or_insert_with(|| QueryRecord {
                hash: hash.to_string(),
                query: query_text.to_string(),
                partition_key: partition_key.to_string(),
                status: QueryStatus::Ok,
                last_seen: Utc::now(),
            });
        Ok(())
    }

    async fn set_query_status(
        &self,
        hash: &str,
        partition_key: &str,
        status: QueryStatus,
    ) -> Result<()> {
        let mut queries = self.queries.write().await;
        let key = (partition_key.to_string(), hash.to_string());
        queries
            .entry(key)
            .and_modify(|record| {
                record.status = status;
                record.last_seen = Utc::now();
            })
            .or_insert_with(|| QueryRecord {
                hash: hash.to_string(),
                query: String::new(),
                partition_key: partition_key.to_string(),
                status,
                last_seen: Utc::now(),
            });
        Ok(())
    }

    async fn get_query_status(
        &self,
        hash: &str,
        partition_key: &str,
    ) -> Result<Option<QueryStatus>> {
        Ok(self
            .queries
            .read()
            .await
            .get(&(partition_key.to_string(), hash.to_string()))
            .map(|record| record.status))
    }

    async fn get_query(&self, hash: &str, partition_key: &str) -> Result<Option<String>> {
        Ok(self
            .queries
            .read()
            .await
            .get(&(partition_key.to_string(), hash.to_string()))
            .map(|record| record.query.clone()))
    }

    async fn get(&self, hash: &str, partition_key: &str) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self
            .entries
            .read()
            .await
            .get(partition_key)
            .and_then(|partition| partition.get(hash))
        {
            return Ok(Some(entry.clone()));
        }
        let status = self.get_query_status(hash, partition_key).await?;
        Ok(match status {
            Some(status) if status.is_tombstone() => Some(CacheEntry::Tombstone(status)),
            _ => None,
        })
    }

    async fn exists(&self, hash: &str, partition_key: &str, check_query: bool) -> Result<bool> {
        let has_payload = self
            .entries
            .read()
            .await
            .get(partition_key)
            .is_some_and(|partition| partition.contains_key(hash));
        if has_payload {
            return Ok(true);
        }
        if check_query {
            if let Some(status) = self.get_query_status(hash, partition_key).await? {
                return Ok(status.is_tombstone());
            }
        }
        Ok(false)
    }

    async fn filter_existing_keys(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<BTreeSet<String>> {
        let entries = self.entries.read().await;
        let Some(partition) = entries.get(partition_key) else {
            return Ok(BTreeSet::new());
        };
        Ok(keys
            .iter()
            .filter(|key| partition.contains_key(*key))
            .cloned()
            .collect())
    }

    async fn get_intersected(
        &self,
        keys: &BTreeSet<String>,
        partition_key: &str,
    ) -> Result<(Option<ValueSet>, usize)> {
        let entries = self.entries.read().await;
        let Some(partition) = entries.get(partition_key) else {
            return Ok((None, 0));
        };
        let mut hits = 0usize;
        let mut intersection: Option<ValueSet> = None;
        for key in keys {
            match partition.get(key) {
                Some(CacheEntry::Set(values)) => {
                    hits += 1;
                    intersection = Some(match intersection {
                        None => values.clone(),
                        Some(current) => current.intersection(values).cloned().collect(),
                    });
                }
                Some(CacheEntry::Null) => hits += 1,
                _ => {}
            }
        }
        Ok((intersection, hits))
    }

    async fn delete(&self, hash: &str, partition_key: &str) -> Result<()> {
        if let Some(partition) = self.entries.write().await.get_mut(partition_key) {
            partition.remove(hash);
        }
        self.queries
            .write()
            .await
            .remove(&(partition_key.to_string(), hash.to_string()));
        Ok(())
    }

    async fn delete_partition(&self, partition_key: &str) -> Result<()> {
        self.entries.write().await.remove(partition_key);
        self.queries
            .write()
            .await
            .retain(|(partition, _), _| partition != partition_key);
        self.metadata.write().await.remove(partition_key);
        Ok(())
    }

    async fn get_all_keys(&self, partition_key: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .get(partition_key)
            .map(|partition| {
                let mut keys: Vec<String> = partition.keys().cloned().collect();
                keys.sort();
                keys
            })
            .unwrap_or_default())
    }

    async fn get_all_queries(&self, partition_key: &str) -> Result<Vec<QueryRecord>> {
        let mut records: Vec<QueryRecord> = self
            .queries
            .read()
            .await
            .values()
            .filter(|record| record.partition_key == partition_key)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(records)
    }

    async fn get_partition_keys(&self) -> Result<Vec<(String, Datatype)>> {
        let metadata = self.metadata.read().await;
        let mut partitions: Vec<(String, Datatype)> = metadata
            .iter()
            .map(|(key, datatype)| (key.clone(), *datatype))
            .collect();
        partitions.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(partitions)
    }

    async fn get_datatype(&self, partition_key: &str) -> Result<Option<Datatype>> {
        Ok(self.metadata.read().await.get(partition_key).copied())
    }

    async fn entry_count(&self, partition_key: &str) -> Result<i64> {
        Ok(self
            .entries
            .read()
            .await
            .get(partition_key)
            .map(|partition| partition.len() as i64)
            .unwrap_or(0))
    }

    async fn prune_old_queries(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut queries = self.queries.write().await;
        let stale: Vec<(String, String)> = queries
            .iter()
            .filter(|(_, record)| record.last_seen < cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        let mut entries = self.entries.write().await;
        for (partition, hash) in &stale {
            queries.remove(&(partition.clone(), hash.clone()));
            if let Some(partition_entries) = entries.get_mut(partition) {
                partition_entries.remove(hash);
            }
        }
        Ok(stale.len() as u64)
    }

    async fn evict(
        &self,
        partition_key: &str,
        strategy: EvictionStrategy,
        threshold: i64,
    ) -> Result<u64> {
        // lock order is queries before entries throughout this handler
        let doomed: Vec<String> = {
            let queries = self.queries.read().await;
            let entries = self.entries.read().await;
            let Some(partition) = entries.get(partition_key) else {
                return Ok(0);
            };
            let excess = partition.len() as i64 - threshold;
            if excess <= 0 {
                return Ok(0);
            }
            let mut candidates: Vec<(String, i64)> = partition
                .iter()
                .map(|(hash, entry)| {
                    let rank = match strategy {
                        EvictionStrategy::Oldest => queries
                            .get(&(partition_key.to_string(), hash.clone()))
                            .map(|record| record.last_seen.timestamp())
                            .unwrap_or(0),
                        EvictionStrategy::Largest => match entry {
                            // negated so the largest payloads sort first
                            CacheEntry::Set(values) => -(values.len() as i64),
                            _ => 0,
                        },
                    };
                    (hash.clone(), rank)
                })
                .collect();
            candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            candidates
                .into_iter()
                .take(excess as usize)
                .map(|(hash, _)| hash)
                .collect()
        };

        let mut queries = self.queries.write().await;
        let mut entries = self.entries.write().await;
        let mut removed = 0u64;
        if let Some(partition) = entries.get_mut(partition_key) {
            for hash in doomed {
                partition.remove(&hash);
                queries.remove(&(partition_key.to_string(), hash));
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_tombstones(&self, partition_key: &str) -> Result<u64> {
        let mut queries = self.queries.write().await;
        let tombstoned: Vec<String> = queries
            .iter()
            .filter(|((partition, _), record)| {
                partition == partition_key && record.status.is_tombstone()
            })
            .map(|((_, hash), _)| hash.clone())
            .collect();
        let mut entries = self.entries.write().await;
        for hash in &tombstoned {
            queries.remove(&(partition_key.to_string(), hash.clone()));
            if let Some(partition) = entries.get_mut(partition_key) {
                partition.remove(hash);
            }
        }
        Ok(tombstoned.len() as u64)
    }

    async fn remove_large_entries(&self, partition_key: &str, max_count: i64) -> Result<u64> {
        let mut queries = self.queries.write().await;
        let mut entries = self.entries.write().await;
        let Some(partition) = entries.get_mut(partition_key) else {
            return Ok(0);
        };
        let large: Vec<String> = partition
            .iter()
            .filter(|(_, entry)| match entry {
                CacheEntry::Set(values) => values.len() as i64 > max_count,
                _ => false,
            })
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in &large {
            partition.remove(hash);
            queries.remove(&(partition_key.to_string(), hash.clone()));
        }
        Ok(large.len() as u64)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::int_set;

    #[tokio::test]
    async fn set_then_get_returns_last_write() {
        let cache = MemoryCacheHandler::new();
        cache
            .register_partition_key("trip_id", Datatype::Integer, &RegisterOptions::default())
            .await
            .unwrap();
        cache
            .set_cache("h1", &int_set([1, 2, 3]), "trip_id")
            .await
            .unwrap();
        assert_eq!(
            cache.get("h1", "trip_id").await.unwrap(),
            Some(CacheEntry::Set(int_set([1, 2, 3])))
        );
        cache
            .set_cache("h1", &int_set([4, 5]), "trip_id")
            .await
            .unwrap();
        assert_eq!(
            cache.get("h1", "trip_id").await.unwrap(),
            Some(CacheEntry::Set(int_set([4, 5])))
        );
    }

    #[tokio::test]
    async fn intersection_with_null_identity() {
        let cache = MemoryCacheHandler::new();
        cache
            .set_cache("h1", &int_set([1, 2, 3]), "trip_id")
            .await
            .unwrap();
        cache
            .set_cache("h2", &int_set([2, 3, 4]), "trip_id")
            .await
            .unwrap();
        cache.set_null("h3", "trip_id").await.unwrap();

        let keys: BTreeSet<String> = ["h1", "h2", "h3", "missing"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (result, hits) = cache.get_intersected(&keys, "trip_id").await.unwrap();
        assert_eq!(hits, 3);
        assert_eq!(result, Some(int_set([2, 3])));
    }

    #[tokio::test]
    async fn empty_cache_returns_no_hits() {
        let cache = MemoryCacheHandler::new();
        let keys: BTreeSet<String> = ["h1"].iter().map(|s| s.to_string()).collect();
        let (result, hits) = cache.get_intersected(&keys, "trip_id").await.unwrap();
        assert_eq!((result, hits), (None, 0));
    }

    #[tokio::test]
    async fn tombstones_count_only_with_check_query() {
        let cache = MemoryCacheHandler::new();
        cache
            .set_query_status("h1", "trip_id", QueryStatus::Timeout)
            .await
            .unwrap();
        assert!(!cache.exists("h1", "trip_id", false).await.unwrap());
        assert!(cache.exists("h1", "trip_id", true).await.unwrap());
        assert_eq!(
            cache.get("h1", "trip_id").await.unwrap(),
            Some(CacheEntry::Tombstone(QueryStatus::Timeout))
        );
    }

    #[tokio::test]
    async fn datatype_registration_is_write_once() {
        let cache = MemoryCacheHandler::new();
        cache
            .register_partition_key("trip_id", Datatype::Integer, &RegisterOptions::default())
            .await
            .unwrap();
        cache
            .register_partition_key("trip_id", Datatype::Integer, &RegisterOptions::default())
            .await
            .unwrap();
        let conflict = cache
            .register_partition_key("trip_id", Datatype::Text, &RegisterOptions::default())
            .await;
        assert!(conflict.is_err());
    }

    #[tokio::test]
    async fn eviction_largest_removes_biggest_payloads() {
        let cache = MemoryCacheHandler::new();
        cache.set_cache("small", &int_set([1]), "p").await.unwrap();
        cache
            .set_cache("big", &int_set([1, 2, 3, 4, 5]), "p")
            .await
            .unwrap();
        cache
            .set_cache("mid", &int_set([1, 2]), "p")
            .await
            .unwrap();
        let removed = cache.evict("p", EvictionStrategy::Largest, 2).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get("big", "p").await.unwrap().is_none());
        assert!(cache.get("small", "p").await.unwrap().is_some());
    }
}
