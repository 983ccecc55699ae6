use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::core::{ObjectMeta, ResourceExt};
use kube::{Api, Client};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::{ResourceStore, StoreError, Versioned};

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "ca-cert-orchestrator";
const KEY_ANNOTATION: &str = "ca-cert-orchestrator.io/key";
const VALUE_FIELD: &str = "value";
const UPSERT_ATTEMPTS: usize = 5;

/// Store keeping one ConfigMap per record in a single namespace.
///
/// ConfigMap names are derived from the record key, the key itself is kept in
/// an annotation so prefix listing does not depend on the name encoding. The
/// ConfigMap `resourceVersion` is the record version.
pub struct ConfigMapStore {
    client: Client,
    namespace: String,
}

impl ConfigMapStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> ConfigMapStore {
        ConfigMapStore {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn to_config_map(
        &self,
        key: &str,
        value: &Value,
        version: Option<String>,
    ) -> Result<ConfigMap, StoreError> {
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.into(), MANAGED_BY.into());
        let mut annotations: BTreeMap<String, String> = BTreeMap::new();
        annotations.insert(KEY_ANNOTATION.into(), key.into());
        let mut data: BTreeMap<String, String> = BTreeMap::new();
        data.insert(VALUE_FIELD.into(), serde_json::to_string(value)?);

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(record_name(key)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                resource_version: version,
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        })
    }
}

pub fn record_name(key: &str) -> String {
    format!(
        "cco-{}",
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).simple()
    )
}

fn record_key(cm: &ConfigMap) -> Option<String> {
    cm.annotations().get(KEY_ANNOTATION).cloned()
}

fn from_config_map(key: &str, cm: &ConfigMap) -> Result<Versioned, StoreError> {
    let raw = cm
        .data
        .as_ref()
        .and_then(|d| d.get(VALUE_FIELD))
        .ok_or_else(|| StoreError::Backend(format!("record {} has no value", key)))?;
    Ok(Versioned {
        value: serde_json::from_str(raw)?,
        version: cm.resource_version().unwrap_or_default(),
    })
}

fn map_error(key: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(error_response) => match error_response.code {
            404 => StoreError::NotFound(key.to_string()),
            409 if error_response.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(key.to_string())
            }
            409 => StoreError::Conflict(key.to_string()),
            _ => StoreError::Backend(error_response.message),
        },
        other => StoreError::Backend(other.to_string()),
    }
}

#[async_trait]
impl ResourceStore for ConfigMapStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        match self.api().get(&record_name(key)).await {
            Ok(cm) => Ok(Some(from_config_map(key, &cm)?)),
            Err(e) => match map_error(key, e) {
                StoreError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn create(&self, key: &str, value: Value) -> Result<Versioned, StoreError> {
        let cm = self.to_config_map(key, &value, None)?;
        let result = self
            .api()
            .create(&PostParams::default(), &cm)
            .await
            .map_err(|e| map_error(key, e))?;
        from_config_map(key, &result)
    }

    async fn replace(
        &self,
        key: &str,
        value: Value,
        version: &str,
    ) -> Result<Versioned, StoreError> {
        let cm = self.to_config_map(key, &value, Some(version.to_string()))?;
        let result = self
            .api()
            .replace(&record_name(key), &PostParams::default(), &cm)
            .await
            .map_err(|e| map_error(key, e))?;
        from_config_map(key, &result)
    }

    async fn upsert(&self, key: &str, value: Value) -> Result<Versioned, StoreError> {
        let mut last = StoreError::Conflict(key.to_string());
        for _ in 0..UPSERT_ATTEMPTS {
            let result = match self.get(key).await? {
                Some(existing) => self.replace(key, value.clone(), &existing.version).await,
                None => self.create(key, value.clone()).await,
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e @ StoreError::Conflict(_)) | Err(e @ StoreError::AlreadyExists(_)) => {
                    debug!(key, "concurrent write, retrying upsert");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match self
            .api()
            .delete(&record_name(key), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match map_error(key, e) {
                StoreError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let lp = ListParams::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY));
        let list = self
            .api()
            .list(&lp)
            .await
            .map_err(|e| map_error(prefix, e))?;

        let mut records: Vec<(String, Value)> = Vec::new();
        for cm in list.items.iter() {
            if let Some(key) = record_key(cm) {
                if key.starts_with(prefix) {
                    let record = from_config_map(&key, cm)?;
                    records.push((key, record.value));
                }
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_names_are_stable_and_dns_safe() {
        let key = "resources/cert/ca1/provider/p1/cert-enrollment/stateInfo";
        let name = record_name(key);
        assert_eq!(name, record_name(key));
        assert!(name.len() <= 63);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert_ne!(name, record_name("resources/cert/ca2"));
    }

    #[test]
    fn config_map_round_trips_key_value_and_version() {
        let mut cm = ConfigMap::default();
        let mut annotations = BTreeMap::new();
        annotations.insert(KEY_ANNOTATION.to_string(), "a/b".to_string());
        cm.metadata.annotations = Some(annotations);
        cm.metadata.resource_version = Some("42".into());
        let mut data = BTreeMap::new();
        data.insert(VALUE_FIELD.to_string(), r#"{"ready":true}"#.to_string());
        cm.data = Some(data);

        assert_eq!(record_key(&cm), Some("a/b".to_string()));
        let record = from_config_map("a/b", &cm).unwrap();
        assert_eq!(record.value, json!({"ready": true}));
        assert_eq!(record.version, "42");
    }

    #[test]
    fn conflicts_are_distinguished_from_existing_records() {
        let exists = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "exists".into(),
            reason: "AlreadyExists".into(),
            code: 409,
        });
        let conflict = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "modified".into(),
            reason: "Conflict".into(),
            code: 409,
        });
        assert!(matches!(map_error("k", exists), StoreError::AlreadyExists(_)));
        assert!(matches!(map_error("k", conflict), StoreError::Conflict(_)));
    }
}
