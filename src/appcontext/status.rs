use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{split_resource_node_name, AppContextClient, ClusterRef};
use crate::crd::CertificateRequest;
use crate::error::Error;
use crate::state::LifecycleState;

/// Per-cluster status bundle written back by the synchronizer
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusBundle {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub resource_count: i64,
    #[serde(default)]
    pub resource_statuses: Vec<ResourceStatusEntry>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
pub struct ResourceStatusEntry {
    #[serde(rename = "Group", default)]
    pub group: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Kind", default)]
    pub kind: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Namespace", default)]
    pub namespace: String,
    /// base64 of the JSON resource as observed on the cluster
    #[serde(rename = "Res", default)]
    pub res: String,
}

impl ResourceStatusEntry {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let raw = STANDARD.decode(self.res.as_bytes())?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl StatusBundle {
    pub fn find(&self, name: &str, kind: &str) -> Option<&ResourceStatusEntry> {
        self.resource_statuses
            .iter()
            .find(|r| r.name == name && r.kind == kind)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ReadyStatus {
    Ready,
    NotReady,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Available,
    Unavailable,
    Unknown,
}

impl Connectivity {
    fn parse(raw: Option<&str>) -> Connectivity {
        match raw {
            Some("available") => Connectivity::Available,
            Some("unavailable") => Connectivity::Unavailable,
            _ => Connectivity::Unknown,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    pub name: String,
    pub kind: String,
    pub ready_status: ReadyStatus,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReport {
    pub cluster_provider: String,
    pub cluster: String,
    pub connectivity: Connectivity,
    pub ready_status: ReadyStatus,
    pub resources: Vec<ResourceReport>,
}

/// Status of one lifecycle as reported to users
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub app: String,
    pub tree_id: String,
    pub deployed_status: Option<LifecycleState>,
    pub ready_status: ReadyStatus,
    pub clusters: Vec<ClusterReport>,
}

impl StatusReport {
    pub fn ready_resources(&self) -> usize {
        self.clusters
            .iter()
            .flat_map(|c| c.resources.iter())
            .filter(|r| r.ready_status == ReadyStatus::Ready)
            .count()
    }

    /// Every cluster reachable and every resource ready; returns the number
    /// of ready resources.
    pub fn validate_ready(&self) -> Result<usize, Error> {
        let not_ready = || Error::not_ready(format!("{} is not ready", self.app));
        if self.ready_status != ReadyStatus::Ready {
            return Err(not_ready());
        }
        for cluster in self.clusters.iter() {
            if cluster.connectivity != Connectivity::Available {
                return Err(Error::not_ready(format!(
                    "{}: cluster {}+{} is not available",
                    self.app, cluster.cluster_provider, cluster.cluster
                )));
            }
            if cluster
                .resources
                .iter()
                .any(|r| r.ready_status != ReadyStatus::Ready)
            {
                return Err(not_ready());
            }
        }
        Ok(self.ready_resources())
    }
}

/// Retry budget for waiting on status bundles
#[derive(Clone, Debug, PartialEq)]
pub struct PollPolicy {
    /// Maximum attempts (0 = keep polling until cancelled)
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 300,
            interval: Duration::from_secs(2),
        }
    }
}

/// Decodes the status bundles the synchronizer writes into a tree
#[derive(Clone)]
pub struct StatusBundleReader {
    contexts: AppContextClient,
}

impl StatusBundleReader {
    pub fn new(contexts: AppContextClient) -> StatusBundleReader {
        StatusBundleReader { contexts }
    }

    pub async fn read_bundle(
        &self,
        tree_id: &str,
        app: &str,
        cluster: &ClusterRef,
    ) -> Result<Option<StatusBundle>, Error> {
        match self.contexts.cluster_status(tree_id, app, cluster).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Like `read_bundle`, but a bundle that does not decode is treated as
    /// not written yet.
    async fn decodable_bundle(
        &self,
        tree_id: &str,
        app: &str,
        cluster: &ClusterRef,
    ) -> Result<Option<StatusBundle>, Error> {
        match self.read_bundle(tree_id, app, cluster).await {
            Err(Error::Serialization(e)) => {
                debug!(tree = %tree_id, cluster = %cluster.cluster, error = %e, "status bundle not decodable yet");
                Ok(None)
            }
            other => other,
        }
    }

    /// Signed CertificateRequests among `expected` resource node names, keyed
    /// by request name. Entries that are missing, undecodable or not yet
    /// signed are left out.
    pub async fn certificate_requests(
        &self,
        tree_id: &str,
        app: &str,
        cluster: &ClusterRef,
        expected: &[String],
    ) -> Result<BTreeMap<String, CertificateRequest>, Error> {
        let mut found: BTreeMap<String, CertificateRequest> = BTreeMap::new();
        let bundle = match self.decodable_bundle(tree_id, app, cluster).await? {
            Some(bundle) => bundle,
            None => return Ok(found),
        };

        for node_name in expected {
            let (name, kind) = match split_resource_node_name(node_name) {
                Some(parts) => parts,
                None => continue,
            };
            let entry = match bundle.find(name, kind) {
                Some(entry) => entry,
                None => continue,
            };
            match entry.decode::<CertificateRequest>() {
                Ok(cr) if cr.is_signed() => {
                    found.insert(name.to_string(), cr);
                }
                Ok(_) => debug!(request = name, "certificate request not signed yet"),
                Err(e) => debug!(request = name, error = %e, "unable to decode certificate request"),
            }
        }
        Ok(found)
    }

    /// Poll until every expected CertificateRequest is signed
    pub async fn await_certificate_requests(
        &self,
        tree_id: &str,
        app: &str,
        cluster: &ClusterRef,
        expected: &[String],
        policy: &PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, CertificateRequest>, Error> {
        let mut attempts = 0u32;
        loop {
            let found = self
                .certificate_requests(tree_id, app, cluster, expected)
                .await?;
            if found.len() == expected.len() {
                info!(tree = %tree_id, count = found.len(), "all certificate requests signed");
                return Ok(found);
            }

            attempts += 1;
            if policy.max_attempts > 0 && attempts >= policy.max_attempts {
                return Err(Error::not_ready(format!(
                    "only {} of {} certificate requests signed in tree {} after {} attempts",
                    found.len(),
                    expected.len(),
                    tree_id,
                    attempts
                )));
            }
            debug!(
                tree = %tree_id,
                signed = found.len(),
                expected = expected.len(),
                "waiting for certificate requests"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("waiting for certificates of tree {}", tree_id)))
                }
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    /// Build the user-facing status of `app` in `tree_id`
    pub async fn report(&self, tree_id: &str, app: &str) -> Result<StatusReport, Error> {
        let tree = self.contexts.load(tree_id).await?;
        let deployed_status = self.contexts.status(tree_id).await?;
        let app_handle = tree
            .app(app)
            .ok_or_else(|| Error::not_found(format!("app {} in tree {}", app, tree_id)))?;

        let mut clusters: Vec<ClusterReport> = Vec::new();
        for (handle, cluster) in tree.clusters(app_handle) {
            let bundle = self.decodable_bundle(tree_id, app, &cluster).await?;
            let connectivity = self.contexts.connectivity(tree_id, app, &cluster).await?;

            let resources: Vec<ResourceReport> = tree
                .resource_names(handle)
                .iter()
                .filter_map(|node| split_resource_node_name(node))
                .map(|(name, kind)| {
                    let present = bundle
                        .as_ref()
                        .map_or(false, |b| b.find(name, kind).is_some());
                    ResourceReport {
                        name: name.to_string(),
                        kind: kind.to_string(),
                        ready_status: if present {
                            ReadyStatus::Ready
                        } else {
                            ReadyStatus::NotReady
                        },
                    }
                })
                .collect();

            let cluster_ready = bundle.as_ref().map_or(false, |b| b.ready)
                && resources.iter().all(|r| r.ready_status == ReadyStatus::Ready);

            clusters.push(ClusterReport {
                cluster_provider: cluster.provider,
                cluster: cluster.cluster,
                connectivity: Connectivity::parse(connectivity.as_deref()),
                ready_status: if cluster_ready {
                    ReadyStatus::Ready
                } else {
                    ReadyStatus::NotReady
                },
                resources,
            });
        }

        let ready = clusters.iter().all(|c| c.ready_status == ReadyStatus::Ready);
        Ok(StatusReport {
            app: app.to_string(),
            tree_id: tree_id.to_string(),
            deployed_status,
            ready_status: if ready {
                ReadyStatus::Ready
            } else {
                ReadyStatus::NotReady
            },
            clusters,
        })
    }
}
