use super::{Filter, Record, RecordStore, Sort, StoreError, StoreResult};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    version: u64,
}

/// In-process record store backing the single-instance deployment and the
/// test suite. One map per collection, one version counter per record.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, Slot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_records(records: &mut [Record], sort: &Sort) {
    match sort {
        Sort::Unsorted => {}
        Sort::Asc(field) => {
            records.sort_by(|a, b| {
                let av = a.value.get(field).cloned().unwrap_or(Value::Null);
                let bv = b.value.get(field).cloned().unwrap_or(Value::Null);
                super::cmp_values(&av, &bv).cmp(&0)
            });
        }
        Sort::Desc(field) => {
            records.sort_by(|a, b| {
                let av = a.value.get(field).cloned().unwrap_or(Value::Null);
                let bv = b.value.get(field).cloned().unwrap_or(Value::Null);
                super::cmp_values(&bv, &av).cmp(&0)
            });
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put(&self, collection: &str, id: &str, value: Value) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        let records = collections.entry(collection.to_string()).or_default();
        let version = records.get(id).map(|slot| slot.version + 1).unwrap_or(1);
        records.insert(id.to_string(), Slot { value, version });
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Record> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .and_then(|records| records.get(id))
            .map(|slot| Record {
                id: id.to_string(),
                value: slot.value.clone(),
                version: slot.version,
            })
            .ok_or(StoreError::NotFound)
    }

    async fn query(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Sort,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Record>> {
        let collections = self.collections.read().await;
        let mut matched: Vec<Record> = collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, slot)| filter.matches(&slot.value))
                    .map(|(id, slot)| Record {
                        id: id.clone(),
                        value: slot.value.clone(),
                        version: slot.version,
                    })
                    .collect()
            })
            .unwrap_or_default();

        sort_records(&mut matched, &sort);
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        value: Value,
    ) -> StoreResult<Record> {
        let mut collections = self.collections.write().await;
        let records = collections
            .get_mut(collection)
            .ok_or(StoreError::NotFound)?;
        let slot = records.get_mut(id).ok_or(StoreError::NotFound)?;

        if slot.version != expected_version {
            return Err(StoreError::Conflict);
        }

        slot.value = value;
        slot.version += 1;
        Ok(Record {
            id: id.to_string(),
            value: slot.value.clone(),
            version: slot.version,
        })
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        let removed = collections
            .get_mut(collection)
            .and_then(|records| records.remove(id));
        match removed {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn stream(&self, collection: &str, filter: Filter) -> BoxStream<'static, Record> {
        // Snapshot under the read lock; consumers iterate lazily after it
        // is released.
        let records = self
            .query(collection, &filter, Sort::Unsorted, None)
            .await
            .unwrap_or_default();
        stream::iter(records).boxed()
    }

    async fn ping(&self) -> StoreResult<()> {
        let _ = self.collections.read().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryStore::new();
        store
            .put("tenants", "t-1", json!({"display_name": "Acme"}))
            .await
            .unwrap();

        let record = store.get("tenants", "t-1").await.unwrap();
        assert_eq!(record.value["display_name"], "Acme");
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn update_detects_stale_version() {
        let store = MemoryStore::new();
        store.put("tasks", "a", json!({"state": "queued"})).await.unwrap();
        let record = store.get("tasks", "a").await.unwrap();

        // Another writer sneaks in.
        store.put("tasks", "a", json!({"state": "running"})).await.unwrap();

        let result = store
            .update("tasks", "a", record.version, json!({"state": "cancelled"}))
            .await;
        assert_eq!(result.unwrap_err(), StoreError::Conflict);
    }

    #[tokio::test]
    async fn query_sorts_and_limits() {
        let store = MemoryStore::new();
        for (id, at) in [("a", "2026-01-03"), ("b", "2026-01-01"), ("c", "2026-01-02")] {
            store
                .put("tasks", id, json!({"tenant_id": "t", "created_at": at}))
                .await
                .unwrap();
        }

        let records = store
            .query(
                "tasks",
                &Filter::new().eq("tenant_id", "t"),
                Sort::Asc("created_at".into()),
                Some(2),
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "b");
        assert_eq!(records[1].id, "c");
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(store.delete("tasks", "nope").await.unwrap_err(), StoreError::NotFound);
    }

    #[tokio::test]
    async fn stream_yields_matching_records() {
        let store = MemoryStore::new();
        store.put("users", "u1", json!({"tenant_id": "a"})).await.unwrap();
        store.put("users", "u2", json!({"tenant_id": "b"})).await.unwrap();

        let stream = store
            .stream("users", Filter::new().eq("tenant_id", "a"))
            .await;
        let records: Vec<Record> = stream.collect().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "u1");
    }
}
