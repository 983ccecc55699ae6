//! Backing key/value store for intent records, lifecycle state and resource trees.
//!
//! Every record is a JSON document addressed by a slash separated key. Each
//! write returns an opaque version token; `replace` only succeeds while the
//! stored version still matches, which is what the lifecycle state machine
//! uses as its compare-and-swap.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

mod configmap;
mod memory;

pub use configmap::ConfigMapStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    AlreadyExists(String),
    #[error("record {0} not found")]
    NotFound(String),
    #[error("record {0} was modified concurrently")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("unable to encode record: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A stored document together with its version token
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned {
    pub value: Value,
    pub version: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Create a record; fails with `AlreadyExists` if the key is taken
    async fn create(&self, key: &str, value: Value) -> Result<Versioned, StoreError>;

    /// Replace a record only if its version is still `version`
    async fn replace(&self, key: &str, value: Value, version: &str)
        -> Result<Versioned, StoreError>;

    /// Create or overwrite unconditionally
    async fn upsert(&self, key: &str, value: Value) -> Result<Versioned, StoreError>;

    /// Delete a record; returns whether something was removed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All records whose key starts with `prefix`, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

/// Typed read on top of a [`ResourceStore`]
pub async fn get_typed<T, S>(store: &S, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
    S: ResourceStore + ?Sized,
{
    match store.get(key).await? {
        Some(record) => Ok(Some(serde_json::from_value(record.value)?)),
        None => Ok(None),
    }
}

/// Typed unconditional write on top of a [`ResourceStore`]
pub async fn put_typed<T, S>(store: &S, key: &str, value: &T) -> Result<Versioned, StoreError>
where
    T: Serialize + Sync,
    S: ResourceStore + ?Sized,
{
    store.upsert(key, serde_json::to_value(value)?).await
}
