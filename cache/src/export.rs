use crate::handler::{CacheHandler, RegisterOptions};
use crate::model::{CacheEntry, Datatype, QueryStatus, Value};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One exported cache entry, serialized as a JSON line by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    pub hash: String,
    pub partition_key: String,
    pub datatype: Datatype,
    pub payload: ExportPayload,
    pub query: Option<String>,
    pub status: QueryStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportPayload {
    Set(Vec<Value>),
    Null,
    Tombstone,
}

/// Collect every entry of a partition into export records.
pub async fn export_partition(
    handler: &dyn CacheHandler,
    partition_key: &str,
) -> Result<Vec<ExportRecord>> {
    let Some(datatype) = handler.get_datatype(partition_key).await? else {
        return Ok(vec![]);
    };
    let mut records = vec![];
    let queries = handler.get_all_queries(partition_key).await?;
    let mut seen = std::collections::BTreeSet::new();
    for record in &queries {
        seen.insert(record.hash.clone());
        let payload = match handler.get(&record.hash, partition_key).await? {
            Some(CacheEntry::Set(values)) => ExportPayload::Set(values.into_iter().collect()),
            Some(CacheEntry::Null) => ExportPayload::Null,
            Some(CacheEntry::Tombstone(_)) | None => ExportPayload::Tombstone,
        };
        records.push(ExportRecord {
            hash: record.hash.clone(),
            partition_key: partition_key.to_string(),
            datatype,
            payload,
            query: Some(record.query.clone()),
            status: record.status,
            last_seen: Some(record.last_seen),
        });
    }
    // payload rows without a query record still export
    for hash in handler.get_all_keys(partition_key).await? {
        if seen.contains(&hash) {
            continue;
        }
        let payload = match handler.get(&hash, partition_key).await? {
            Some(CacheEntry::Set(values)) => ExportPayload::Set(values.into_iter().collect()),
            Some(CacheEntry::Null) => ExportPayload::Null,
            _ => continue,
        };
        records.push(ExportRecord {
            hash,
            partition_key: partition_key.to_string(),
            datatype,
            payload,
            query: None,
            status: QueryStatus::Ok,
            last_seen: None,
        });
    }
    info!("exported {} entries from partition '{partition_key}'", records.len());
    Ok(records)
}

/// Export every partition of the cache.
pub async fn export_all(handler: &dyn CacheHandler) -> Result<Vec<ExportRecord>> {
    let mut records = vec![];
    for (partition_key, _) in handler.get_partition_keys().await? {
        records.extend(export_partition(handler, &partition_key).await?);
    }
    Ok(records)
}

/// Import records into a cache, optionally retargeting a single partition
/// key. The target partition must be absent or registered with the same
/// datatype.
pub async fn import_records(
    handler: &dyn CacheHandler,
    records: &[ExportRecord],
    target_partition_key: Option<&str>,
) -> Result<usize> {
    let mut imported = 0usize;
    for record in records {
        let partition_key = target_partition_key.unwrap_or(&record.partition_key);
        handler
            .register_partition_key(partition_key, record.datatype, &RegisterOptions::default())
            .await?;
        match &record.payload {
            ExportPayload::Set(values) => {
                let set = values.iter().cloned().collect();
                handler.set_cache(&record.hash, &set, partition_key).await?;
            }
            ExportPayload::Null => handler.set_null(&record.hash, partition_key).await?,
            ExportPayload::Tombstone => {}
        }
        if let Some(query) = &record.query {
            if !query.is_empty() {
                handler.set_query(&record.hash, query, partition_key).await?;
            }
        }
        if record.status.is_tombstone() {
            handler
                .set_query_status(&record.hash, partition_key, record.status)
                .await?;
        }
        imported += 1;
    }
    if imported < records.len() {
        warn!("imported {imported} of {} records", records.len());
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCacheHandler;
    use crate::model::int_set;

    #[tokio::test]
    async fn export_then_import_restores_entries() {
        let source = MemoryCacheHandler::new();
        source
            .register_partition_key("trip_id", Datatype::Integer, &RegisterOptions::default())
            .await
            .unwrap();
        source
            .set_cache("h1", &int_set([1, 2, 3]), "trip_id")
            .await
            .unwrap();
        source
            .set_query("h1", "SELECT DISTINCT t1.trip_id FROM trips AS t1", "trip_id")
            .await
            .unwrap();
        source.set_null("h2", "trip_id").await.unwrap();
        source
            .set_query_status("h3", "trip_id", QueryStatus::Timeout)
            .await
            .unwrap();

        let records = export_partition(&source, "trip_id").await.unwrap();
        assert_eq!(records.len(), 3);

        let target = MemoryCacheHandler::new();
        import_records(&target, &records, None).await.unwrap();
        assert_eq!(
            target.get("h1", "trip_id").await.unwrap(),
            Some(CacheEntry::Set(int_set([1, 2, 3])))
        );
        assert_eq!(
            target.get("h2", "trip_id").await.unwrap(),
            Some(CacheEntry::Null)
        );
        assert_eq!(
            target.get_query_status("h3", "trip_id").await.unwrap(),
            Some(QueryStatus::Timeout)
        );
        assert_eq!(
            target.get_query("h1", "trip_id").await.unwrap().as_deref(),
            Some("SELECT DISTINCT t1.trip_id FROM trips AS t1")
        );
    }

    #[tokio::test]
    async fn import_can_retarget_the_partition_key() {
        let source = MemoryCacheHandler::new();
        source
            .set_cache("h1", &int_set([9]), "trip_id")
            .await
            .unwrap();
        let records = export_partition(&source, "trip_id").await.unwrap();

        let target = MemoryCacheHandler::new();
        import_records(&target, &records, Some("ride_id")).await.unwrap();
        assert_eq!(
            target.get("h1", "ride_id").await.unwrap(),
            Some(CacheEntry::Set(int_set([9])))
        );
        assert_eq!(target.get("h1", "trip_id").await.unwrap(), None);
        assert_eq!(
            target.get_datatype("ride_id").await.unwrap(),
            Some(Datatype::Integer)
        );
    }
}
