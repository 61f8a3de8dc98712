use async_trait::async_trait;
use rideshare_core::{CasOutcome, PersistenceError, RecordStore, Versioned};
use rideshare_shared::{Collection, RecordChange};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

pub const DEFAULT_FEED_CAPACITY: usize = 1024;

struct StoredRecord {
    seq: u64,
    version: u64,
    value: Value,
}

#[derive(Default)]
struct State {
    collections: HashMap<Collection, HashMap<String, StoredRecord>>,
    next_seq: u64,
}

impl State {
    fn write(&mut self, collection: Collection, key: &str, value: Value) -> u64 {
        let records = self.collections.entry(collection).or_default();
        match records.get_mut(key) {
            Some(record) => {
                record.version += 1;
                record.value = value;
                record.version
            }
            None => {
                self.next_seq += 1;
                records.insert(
                    key.to_string(),
                    StoredRecord {
                        seq: self.next_seq,
                        version: 1,
                        value,
                    },
                );
                1
            }
        }
    }
}

/// Process-local record store. Writes and change notifications happen
/// under one write lock, so the feed order is the commit order.
pub struct MemoryRecordStore {
    state: RwLock<State>,
    changes: broadcast::Sender<RecordChange>,
    failing_writes: AtomicU32,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(feed_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            state: RwLock::new(State::default()),
            changes,
            failing_writes: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` writes fail with `Unavailable` without
    /// touching any record. Used to exercise collaborator failure paths.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), PersistenceError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(PersistenceError::Unavailable("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn publish(&self, change: RecordChange) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn generate_key(&self) -> String {
        Uuid::new_v4().to_string()
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Versioned>, PersistenceError> {
        let state = self.state.read().await;
        Ok(state
            .collections
            .get(&collection)
            .and_then(|records| records.get(key))
            .map(|record| Versioned {
                version: record.version,
                value: record.value.clone(),
            }))
    }

    async fn list(&self, collection: Collection) -> Result<Vec<(String, Versioned)>, PersistenceError> {
        let state = self.state.read().await;
        let Some(records) = state.collections.get(&collection) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<(u64, String, Versioned)> = records
            .iter()
            .map(|(key, record)| {
                (
                    record.seq,
                    key.clone(),
                    Versioned {
                        version: record.version,
                        value: record.value.clone(),
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(seq, _, _)| *seq);

        Ok(rows.into_iter().map(|(_, key, record)| (key, record)).collect())
    }

    async fn put(&self, collection: Collection, key: &str, value: Value) -> Result<u64, PersistenceError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let version = state.write(collection, key, value);
        self.publish(RecordChange::put(collection, key, version));
        Ok(version)
    }

    async fn compare_and_put(
        &self,
        collection: Collection,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<CasOutcome, PersistenceError> {
        self.check_write()?;
        let mut state = self.state.write().await;

        let current = state
            .collections
            .get(&collection)
            .and_then(|records| records.get(key))
            .map(|record| record.version);
        if current != expected {
            return Ok(CasOutcome::Conflict { current });
        }

        let version = state.write(collection, key, value);
        self.publish(RecordChange::put(collection, key, version));
        Ok(CasOutcome::Committed(version))
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, PersistenceError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let removed = state
            .collections
            .get_mut(&collection)
            .and_then(|records| records.remove(key))
            .is_some();
        if removed {
            self.publish(RecordChange::deleted(collection, key));
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rideshare_shared::ChangeKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_compare_and_put_versions() {
        let store = MemoryRecordStore::new();
        let key = store.generate_key();

        let created = store
            .compare_and_put(Collection::Trips, &key, None, json!({ "seats": 4 }))
            .await
            .unwrap();
        assert_eq!(created, CasOutcome::Committed(1));

        // Creating twice must not clobber.
        let again = store
            .compare_and_put(Collection::Trips, &key, None, json!({ "seats": 0 }))
            .await
            .unwrap();
        assert_eq!(again, CasOutcome::Conflict { current: Some(1) });

        let updated = store
            .compare_and_put(Collection::Trips, &key, Some(1), json!({ "seats": 3 }))
            .await
            .unwrap();
        assert_eq!(updated, CasOutcome::Committed(2));

        let stale = store
            .compare_and_put(Collection::Trips, &key, Some(1), json!({ "seats": 2 }))
            .await
            .unwrap();
        assert_eq!(stale, CasOutcome::Conflict { current: Some(2) });

        let record = store.get(Collection::Trips, &key).await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.value, json!({ "seats": 3 }));
    }

    #[tokio::test]
    async fn test_list_keeps_insertion_order() {
        let store = MemoryRecordStore::new();
        for key in ["c", "a", "b"] {
            store.put(Collection::Pickups, key, json!({ "k": key })).await.unwrap();
        }
        // Rewriting does not move a record.
        store.put(Collection::Pickups, "c", json!({ "k": "c2" })).await.unwrap();

        let keys: Vec<String> = store
            .list(Collection::Pickups)
            .await
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
        assert!(store.list(Collection::Trips).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_is_shallow() {
        let store = MemoryRecordStore::new();
        store
            .put(Collection::Pickups, "p1", json!({ "status": "pending", "estimatedTime": null }))
            .await
            .unwrap();

        let merged = store
            .merge(Collection::Pickups, "p1", json!({ "estimatedTime": "2025-01-01T10:00:00Z" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.version, 2);
        assert_eq!(merged.value["status"], "pending");
        assert_eq!(merged.value["estimatedTime"], "2025-01-01T10:00:00Z");

        let missing = store.merge(Collection::Pickups, "nope", json!({ "a": 1 })).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_feed_reports_commits_in_order() {
        let store = MemoryRecordStore::new();
        let mut feed = store.subscribe();

        store.put(Collection::Trips, "t1", json!({})).await.unwrap();
        store.put(Collection::Trips, "t1", json!({ "x": 1 })).await.unwrap();
        assert!(store.delete(Collection::Trips, "t1").await.unwrap());
        assert!(!store.delete(Collection::Trips, "t1").await.unwrap());

        assert_eq!(feed.recv().await.unwrap().kind, ChangeKind::Put { version: 1 });
        assert_eq!(feed.recv().await.unwrap().kind, ChangeKind::Put { version: 2 });
        let deleted = feed.recv().await.unwrap();
        assert_eq!(deleted.kind, ChangeKind::Deleted);
        assert_eq!(deleted.key, "t1");
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_injected_failures_write_nothing() {
        let store = MemoryRecordStore::new();
        store.fail_next_writes(1);

        let err = store.put(Collection::Trips, "t1", json!({})).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.get(Collection::Trips, "t1").await.unwrap().is_none());

        store.put(Collection::Trips, "t1", json!({})).await.unwrap();
        assert!(store.get(Collection::Trips, "t1").await.unwrap().is_some());
    }
}
