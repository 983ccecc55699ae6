use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{ResourceStore, StoreError, Versioned};

/// Process-local store used for tests and single-shot CLI runs
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, (Value, u64)>>,
    /// Store-wide revision; versions are never reused, even across delete
    revision: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }

    fn next_version(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn versioned(value: &Value, version: u64) -> Versioned {
    Versioned {
        value: value.clone(),
        version: version.to_string(),
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(key).map(|(v, version)| versioned(v, *version)))
    }

    async fn create(&self, key: &str, value: Value) -> Result<Versioned, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let version = self.next_version();
        let result = versioned(&value, version);
        records.insert(key.to_string(), (value, version));
        Ok(result)
    }

    async fn replace(
        &self,
        key: &str,
        value: Value,
        version: &str,
    ) -> Result<Versioned, StoreError> {
        let mut records = self.records.write().await;
        let entry = records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if entry.1.to_string() != version {
            return Err(StoreError::Conflict(key.to_string()));
        }
        entry.0 = value;
        entry.1 = self.next_version();
        Ok(versioned(&entry.0, entry.1))
    }

    async fn upsert(&self, key: &str, value: Value) -> Result<Versioned, StoreError> {
        let mut records = self.records.write().await;
        let version = self.next_version();
        let result = versioned(&value, version);
        records.insert(key.to_string(), (value, version));
        Ok(result)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replace_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        let first = store.create("a", json!({"n": 1})).await.unwrap();
        store.replace("a", json!({"n": 2}), &first.version).await.unwrap();

        let err = store
            .replace("a", json!({"n": 3}), &first.version)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.get("a").await.unwrap().unwrap().value, json!({"n": 2}));
    }

    #[tokio::test]
    async fn recreated_key_rejects_version_from_before_delete() {
        let store = MemoryStore::new();
        let old = store.create("a", json!({"n": 1})).await.unwrap();
        assert!(store.delete("a").await.unwrap());
        let new = store.create("a", json!({"n": 2})).await.unwrap();
        assert_ne!(old.version, new.version);

        let err = store
            .replace("a", json!({"n": 3}), &old.version)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        store.replace("a", json!({"n": 3}), &new.version).await.unwrap();
    }

    #[tokio::test]
    async fn create_rejects_existing_key() {
        let store = MemoryStore::new();
        store.create("a", json!(1)).await.unwrap();
        assert!(matches!(
            store.create("a", json!(2)).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn list_only_returns_prefixed_keys() {
        let store = MemoryStore::new();
        store.upsert("appcontext/1/status", json!("Created")).await.unwrap();
        store.upsert("appcontext/1", json!({})).await.unwrap();
        store.upsert("appcontext/2", json!({})).await.unwrap();
        store.upsert("resources/x", json!({})).await.unwrap();

        let keys: Vec<String> = store
            .list("appcontext/1")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["appcontext/1", "appcontext/1/status"]);
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let store = MemoryStore::new();
        store.upsert("k", json!(true)).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
