//! Cluster inventory as seen by the orchestrators: label queries and
//! per-cluster key/value settings.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Error;

/// Name of the cluster kv record holding certificate overrides
pub const CERT_KV: &str = "cert-kv";
pub const COMMON_NAME_KEY: &str = "commonName";
pub const SERVICE_MESH_KEY: &str = "serviceMesh";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    /// Clusters of `provider` currently carrying `label`
    async fn clusters_by_label(&self, provider: &str, label: &str) -> Result<Vec<String>, Error>;

    /// Value of `key` in the kv record `kv_name` of a cluster, if set
    async fn cluster_kv(
        &self,
        provider: &str,
        cluster: &str,
        kv_name: &str,
        key: &str,
    ) -> Result<Option<String>, Error>;
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
pub struct ClusterEntry {
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// kv record name -> key -> value
    #[serde(default)]
    pub kv: BTreeMap<String, BTreeMap<String, String>>,
}

/// Inventory held in memory, loaded from configuration. Labels can be
/// changed at runtime and every query sees the current set.
#[derive(Clone, Default)]
pub struct StaticInventory {
    clusters: Arc<RwLock<Vec<ClusterEntry>>>,
}

impl StaticInventory {
    pub fn new(clusters: Vec<ClusterEntry>) -> StaticInventory {
        StaticInventory {
            clusters: Arc::new(RwLock::new(clusters)),
        }
    }

    pub async fn upsert(&self, entry: ClusterEntry) {
        let mut clusters = self.clusters.write().await;
        match clusters
            .iter_mut()
            .find(|c| c.provider == entry.provider && c.name == entry.name)
        {
            Some(existing) => *existing = entry,
            None => clusters.push(entry),
        }
    }

    pub async fn set_labels(
        &self,
        provider: &str,
        cluster: &str,
        labels: Vec<String>,
    ) -> Result<(), Error> {
        let mut clusters = self.clusters.write().await;
        let entry = clusters
            .iter_mut()
            .find(|c| c.provider == provider && c.name == cluster)
            .ok_or_else(|| Error::not_found(format!("cluster {}+{}", provider, cluster)))?;
        entry.labels = labels;
        Ok(())
    }
}

#[async_trait]
impl ClusterInventory for StaticInventory {
    async fn clusters_by_label(&self, provider: &str, label: &str) -> Result<Vec<String>, Error> {
        let clusters = self.clusters.read().await;
        Ok(clusters
            .iter()
            .filter(|c| c.provider == provider && c.labels.iter().any(|l| l == label))
            .map(|c| c.name.clone())
            .collect())
    }

    async fn cluster_kv(
        &self,
        provider: &str,
        cluster: &str,
        kv_name: &str,
        key: &str,
    ) -> Result<Option<String>, Error> {
        let clusters = self.clusters.read().await;
        Ok(clusters
            .iter()
            .find(|c| c.provider == provider && c.name == cluster)
            .and_then(|c| c.kv.get(kv_name))
            .and_then(|kv| kv.get(key))
            .cloned())
    }
}
