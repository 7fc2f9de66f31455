//! In-process store used by tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{EntityStore, RecordQuery, RecordStore, Result, StoreError};
use crate::pipeline::model::{BatchKey, Entity, EntityPatch, PersistedRecord};

#[derive(Debug)]
struct StoredRecord {
    collection: String,
    seq: u64,
    record: PersistedRecord,
}

#[derive(Debug, Default)]
struct State {
    records: Vec<StoredRecord>,
    entities: HashMap<(String, String), Entity>,
    next_seq: u64,
    insert_batches: Vec<usize>,
    entity_writes: usize,
    failing_inserts: u32,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records of one collection in commit order.
    pub fn records(&self, collection: &str) -> Vec<PersistedRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.collection == collection)
            .map(|r| r.record.clone())
            .collect()
    }

    /// Size of every successful `insert_many` call, in order.
    pub fn insert_batches(&self) -> Vec<usize> {
        self.lock().insert_batches.clone()
    }

    /// Successful record and entity writes.
    pub fn write_count(&self) -> usize {
        let state = self.lock();
        state.insert_batches.len() + state.entity_writes
    }

    /// Make the next `n` `insert_many` calls fail without writing anything.
    pub fn fail_next_inserts(&self, n: u32) {
        self.lock().failing_inserts = n;
    }

    pub fn entity(&self, kind: &str, key: &str) -> Option<Entity> {
        self.lock()
            .entities
            .get(&(kind.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_many(&self, collection: &str, records: &[PersistedRecord]) -> Result<()> {
        let mut state = self.lock();
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(StoreError::Write(format!(
                "injected failure for {} records",
                records.len()
            )));
        }

        // Validate the whole batch before touching state.
        let existing: HashSet<(&BatchKey, String)> = state
            .records
            .iter()
            .filter(|r| r.collection == collection)
            .map(|r| (&r.record.key, r.record.partition.to_storage()))
            .collect();
        let mut incoming = HashSet::new();
        for rec in records {
            let id = (&rec.key, rec.partition.to_storage());
            if existing.contains(&id) || !incoming.insert(id) {
                return Err(StoreError::DuplicateKey(format!(
                    "{collection}: {} in {}",
                    rec.partition, rec.key
                )));
            }
        }
        drop(existing);

        for rec in records {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.records.push(StoredRecord {
                collection: collection.to_string(),
                seq,
                record: rec.clone(),
            });
        }
        state.insert_batches.push(records.len());
        Ok(())
    }

    async fn count_by_key(&self, collection: &str, key: &BatchKey) -> Result<u64> {
        let state = self.lock();
        Ok(state
            .records
            .iter()
            .filter(|r| r.collection == collection && &r.record.key == key)
            .count() as u64)
    }

    async fn find_one(
        &self,
        collection: &str,
        query: &RecordQuery,
    ) -> Result<Option<PersistedRecord>> {
        let state = self.lock();
        Ok(state
            .records
            .iter()
            .filter(|r| r.collection == collection && query.matches(&r.record))
            .max_by_key(|r| (r.record.partition.ordinal(), r.seq))
            .map(|r| r.record.clone()))
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_entity(&self, kind: &str, key: &str) -> Result<Option<Entity>> {
        Ok(self.entity(kind, key))
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        let mut state = self.lock();
        let id = (entity.kind.clone(), entity.key.clone());
        if state.entities.contains_key(&id) {
            return Err(StoreError::DuplicateKey(format!("{}/{}", entity.kind, entity.key)));
        }
        state.entities.insert(id, entity.clone());
        state.entity_writes += 1;
        Ok(())
    }

    async fn update_entity(&self, kind: &str, key: &str, patch: &EntityPatch) -> Result<()> {
        let mut state = self.lock();
        let entity = state
            .entities
            .get_mut(&(kind.to_string(), key.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("{kind}/{key}")))?;
        entity.apply(patch);
        state.entity_writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::PartitionKey;
    use chrono::NaiveDate;
    use serde_json::json;

    fn key() -> BatchKey {
        BatchKey::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), "assets")
    }

    fn rec(rank: u64) -> PersistedRecord {
        PersistedRecord::new(key(), PartitionKey::Rank(rank), json!({ "ranking": rank }))
    }

    #[tokio::test]
    async fn duplicate_in_batch_rejects_whole_batch() {
        let store = MemoryStore::new();
        let err = store
            .insert_many("c", &[rec(1), rec(2), rec(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
        assert_eq!(store.count_by_key("c", &key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_against_committed_rows_is_rejected() {
        let store = MemoryStore::new();
        store.insert_many("c", &[rec(1)]).await.unwrap();
        assert!(store.insert_many("c", &[rec(2), rec(1)]).await.is_err());
        assert_eq!(store.count_by_key("c", &key()).await.unwrap(), 1);
        // Other collections are independent partitions.
        store.insert_many("d", &[rec(1)]).await.unwrap();
    }

    #[tokio::test]
    async fn find_one_prefers_highest_ordinal() {
        let store = MemoryStore::new();
        store.insert_many("c", &[rec(5), rec(9), rec(7)]).await.unwrap();
        let found = store
            .find_one("c", &RecordQuery::for_kind("assets"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.partition, PartitionKey::Rank(9));
        assert!(store
            .find_one("c", &RecordQuery::for_kind("lottery"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn injected_failure_writes_nothing() {
        let store = MemoryStore::new();
        store.fail_next_inserts(1);
        assert!(matches!(
            store.insert_many("c", &[rec(1)]).await,
            Err(StoreError::Write(_))
        ));
        store.insert_many("c", &[rec(1)]).await.unwrap();
        assert_eq!(store.insert_batches(), vec![1]);
    }
}
