//! Intent records owned by the API layer: certificate intents, cluster groups,
//! logical clouds and the private keys generated during enrollment.
//!
//! Only the thin persistence these records need is implemented here. All
//! records live under the `resources/` collection of the backing store.

use std::fmt;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::state::{Lifecycle, StateKey};
use crate::store::{get_typed, put_typed, ResourceStore};

pub const COLLECTION: &str = "resources";

/// The scope a certificate intent is orchestrated under
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    ClusterProvider { provider: String },
    LogicalCloud { project: String, logical_cloud: String },
}

impl Scope {
    pub fn provider(provider: impl Into<String>) -> Scope {
        Scope::ClusterProvider {
            provider: provider.into(),
        }
    }

    pub fn logical_cloud(project: impl Into<String>, logical_cloud: impl Into<String>) -> Scope {
        Scope::LogicalCloud {
            project: project.into(),
            logical_cloud: logical_cloud.into(),
        }
    }

    fn path(&self) -> String {
        match self {
            Scope::ClusterProvider { provider } => format!("provider/{}", provider),
            Scope::LogicalCloud {
                project,
                logical_cloud,
            } => format!("project/{}/logicalCloud/{}", project, logical_cloud),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// Identifies one certificate intent within a scope
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct CertKey {
    pub cert: String,
    pub scope: Scope,
}

impl CertKey {
    pub fn new(cert: impl Into<String>, scope: Scope) -> CertKey {
        CertKey {
            cert: cert.into(),
            scope,
        }
    }

    fn base(&self) -> String {
        format!("{}/cert/{}/{}", COLLECTION, self.cert, self.scope.path())
    }

    pub fn data_key(&self) -> String {
        format!("{}/data", self.base())
    }

    pub fn cluster_group_prefix(&self) -> String {
        format!("{}/clusterGroup/", self.base())
    }

    pub fn cluster_group_key(&self, group: &str) -> String {
        format!("{}{}/data", self.cluster_group_prefix(), group)
    }

    /// Lookup key of one of the two lifecycle records of this intent
    pub fn lifecycle(&self, lifecycle: Lifecycle) -> LifecycleKey {
        LifecycleKey {
            cert: self.clone(),
            lifecycle,
        }
    }
}

impl fmt::Display for CertKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.cert, self.scope)
    }
}

/// (cert, scope, app-name) triple addressing a StateInfo record
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct LifecycleKey {
    pub cert: CertKey,
    pub lifecycle: Lifecycle,
}

impl StateKey for LifecycleKey {
    fn store_key(&self) -> String {
        format!("{}/{}/stateInfo", self.cert.base(), self.lifecycle.app_name())
    }

    fn event_name(&self) -> String {
        format!("{} {}", self.lifecycle.app_name(), self.cert)
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,
    pub kind: String,
    pub group: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct IssuingCluster {
    pub cluster: String,
    pub cluster_provider: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Locale {
    #[serde(default)]
    pub country: Vec<String>,
    #[serde(default)]
    pub state: Vec<String>,
    #[serde(default)]
    pub locality: Vec<String>,
    #[serde(default)]
    pub postal_code: Vec<String>,
    #[serde(default)]
    pub street_address: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Names {
    #[serde(default)]
    pub common_name_prefix: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub units: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    #[serde(default)]
    pub locale: Locale,
    #[serde(default)]
    pub names: Names,
    #[serde(default)]
    pub organization: Organization,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Algorithm {
    #[serde(default)]
    pub signature_algorithm: String,
    #[serde(default)]
    pub public_key_algorithm: String,
}

/// CSR template carried by a certificate intent
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CsrInfo {
    #[serde(default)]
    pub key_size: Option<usize>,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub email_addresses: Vec<String>,
    #[serde(default)]
    pub key_usages: Vec<String>,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub subject: Subject,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertSpec {
    #[serde(rename = "isCA", default)]
    pub is_ca: bool,
    pub issuer_ref: IssuerRef,
    /// Requested validity, e.g. `8760h`
    #[serde(default)]
    pub duration: Option<String>,
    pub issuing_cluster: IssuingCluster,
    #[serde(default)]
    pub csr_info: CsrInfo,
}

/// A CA-certificate intent
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema)]
pub struct Cert {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub spec: CertSpec,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GroupScope {
    Name,
    Label,
}

/// Target cluster selection
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema)]
#[serde(untagged)]
pub enum ClusterGroupSpec {
    Provider {
        scope: GroupScope,
        provider: String,
        #[serde(default)]
        cluster: Option<String>,
        #[serde(default)]
        label: Option<String>,
    },
    LogicalCloud {
        #[serde(rename = "logicalCloud")]
        logical_cloud: String,
    },
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema)]
pub struct ClusterGroup {
    pub name: String,
    pub spec: ClusterGroupSpec,
}

impl ClusterGroup {
    pub fn by_name(
        name: impl Into<String>,
        provider: impl Into<String>,
        cluster: impl Into<String>,
    ) -> ClusterGroup {
        ClusterGroup {
            name: name.into(),
            spec: ClusterGroupSpec::Provider {
                scope: GroupScope::Name,
                provider: provider.into(),
                cluster: Some(cluster.into()),
                label: None,
            },
        }
    }

    pub fn by_label(
        name: impl Into<String>,
        provider: impl Into<String>,
        label: impl Into<String>,
    ) -> ClusterGroup {
        ClusterGroup {
            name: name.into(),
            spec: ClusterGroupSpec::Provider {
                scope: GroupScope::Label,
                provider: provider.into(),
                cluster: None,
                label: Some(label.into()),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReference {
    pub provider: String,
    pub cluster: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogicalCloud {
    pub name: String,
    pub project: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub cluster_references: Vec<ClusterReference>,
}

pub fn default_namespace() -> String {
    "default".into()
}

impl LogicalCloud {
    pub fn key(project: &str, logical_cloud: &str) -> String {
        format!(
            "{}/project/{}/logicalCloud/{}/data",
            COLLECTION, project, logical_cloud
        )
    }
}

/// Private key generated for one cluster's certificate request
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct Key {
    /// Name of the CertificateRequest the key belongs to
    pub name: String,
    /// base64 encoded PEM private key
    pub val: String,
}

impl Key {
    pub fn store_key(cert: &str, cluster: &str, provider: &str, tree_id: &str) -> String {
        format!(
            "{}/cert/{}/cluster/{}/provider/{}/context/{}/key",
            COLLECTION, cert, cluster, provider, tree_id
        )
    }
}

/// Read/write access to intent records
#[derive(Clone)]
pub struct IntentClient {
    store: Arc<dyn ResourceStore>,
}

impl IntentClient {
    pub fn new(store: Arc<dyn ResourceStore>) -> IntentClient {
        IntentClient { store }
    }

    pub async fn create_cert(&self, key: &CertKey, cert: &Cert) -> Result<(), Error> {
        put_typed(self.store.as_ref(), &key.data_key(), cert).await?;
        Ok(())
    }

    pub async fn get_cert(&self, key: &CertKey) -> Result<Cert, Error> {
        get_typed(self.store.as_ref(), &key.data_key())
            .await?
            .ok_or_else(|| Error::not_found(format!("cert {}", key)))
    }

    pub async fn delete_cert(&self, key: &CertKey) -> Result<(), Error> {
        if !self.store.delete(&key.data_key()).await? {
            return Err(Error::not_found(format!("cert {}", key)));
        }
        Ok(())
    }

    pub async fn create_cluster_group(
        &self,
        key: &CertKey,
        group: &ClusterGroup,
    ) -> Result<(), Error> {
        put_typed(
            self.store.as_ref(),
            &key.cluster_group_key(&group.name),
            group,
        )
        .await?;
        Ok(())
    }

    pub async fn delete_cluster_group(&self, key: &CertKey, group: &str) -> Result<(), Error> {
        if !self.store.delete(&key.cluster_group_key(group)).await? {
            return Err(Error::not_found(format!("cluster group {} of {}", group, key)));
        }
        Ok(())
    }

    pub async fn list_cluster_groups(&self, key: &CertKey) -> Result<Vec<ClusterGroup>, Error> {
        let mut groups: Vec<ClusterGroup> = Vec::new();
        for (_, value) in self.store.list(&key.cluster_group_prefix()).await? {
            groups.push(serde_json::from_value(value)?);
        }
        Ok(groups)
    }

    pub async fn create_logical_cloud(&self, lc: &LogicalCloud) -> Result<(), Error> {
        put_typed(
            self.store.as_ref(),
            &LogicalCloud::key(&lc.project, &lc.name),
            lc,
        )
        .await?;
        Ok(())
    }

    pub async fn get_logical_cloud(
        &self,
        project: &str,
        logical_cloud: &str,
    ) -> Result<LogicalCloud, Error> {
        get_typed(
            self.store.as_ref(),
            &LogicalCloud::key(project, logical_cloud),
        )
        .await?
        .ok_or_else(|| {
            Error::not_found(format!(
                "logical cloud {} in project {}",
                logical_cloud, project
            ))
        })
    }

    pub async fn save_key(&self, store_key: &str, key: &Key) -> Result<(), Error> {
        put_typed(self.store.as_ref(), store_key, key).await?;
        Ok(())
    }

    pub async fn get_key(&self, store_key: &str) -> Result<Key, Error> {
        get_typed(self.store.as_ref(), store_key)
            .await?
            .ok_or_else(|| Error::not_found(format!("private key {}", store_key)))
    }

    /// Remove a private key; a missing key is not an error
    pub async fn delete_key(&self, store_key: &str) -> Result<bool, Error> {
        Ok(self.store.delete(store_key).await?)
    }

    /// Store keys of every private key generated for `cert` in `tree_id`
    pub async fn key_paths(&self, cert: &str, tree_id: &str) -> Result<Vec<String>, Error> {
        let prefix = format!("{}/cert/{}/cluster/", COLLECTION, cert);
        let suffix = format!("/context/{}/key", tree_id);
        Ok(self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.ends_with(&suffix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[test]
    fn label_group_deserializes_from_api_shape() {
        let group: ClusterGroup = serde_json::from_value(json!({
            "name": "edge",
            "spec": {"scope": "label", "provider": "p1", "label": "edge"}
        }))
        .unwrap();
        assert_eq!(group, ClusterGroup::by_label("edge", "p1", "edge"));
    }

    #[test]
    fn logical_cloud_group_deserializes_from_api_shape() {
        let group: ClusterGroup = serde_json::from_value(json!({
            "name": "lc-group",
            "spec": {"logicalCloud": "lc1"}
        }))
        .unwrap();
        assert_eq!(
            group.spec,
            ClusterGroupSpec::LogicalCloud {
                logical_cloud: "lc1".into()
            }
        );
    }

    #[test]
    fn state_keys_differ_per_lifecycle_and_scope() {
        let provider = CertKey::new("ca1", Scope::provider("p1"));
        let cloud = CertKey::new("ca1", Scope::logical_cloud("proj", "lc1"));
        assert_eq!(
            provider.lifecycle(Lifecycle::Enrollment).store_key(),
            "resources/cert/ca1/provider/p1/cert-enrollment/stateInfo"
        );
        assert_eq!(
            cloud.lifecycle(Lifecycle::Distribution).store_key(),
            "resources/cert/ca1/project/proj/logicalCloud/lc1/cert-distribution/stateInfo"
        );
    }

    #[tokio::test]
    async fn cluster_groups_are_listed_per_cert() {
        let client = IntentClient::new(Arc::new(MemoryStore::new()));
        let ca1 = CertKey::new("ca1", Scope::provider("p1"));
        let ca10 = CertKey::new("ca10", Scope::provider("p1"));
        client
            .create_cluster_group(&ca1, &ClusterGroup::by_name("g1", "p1", "c1"))
            .await
            .unwrap();
        client
            .create_cluster_group(&ca10, &ClusterGroup::by_name("g2", "p1", "c2"))
            .await
            .unwrap();

        let groups = client.list_cluster_groups(&ca1).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "g1");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let client = IntentClient::new(Arc::new(MemoryStore::new()));
        let err = client
            .get_key(&Key::store_key("ca1", "c1", "p1", "123"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn key_paths_are_scoped_to_one_tree() {
        let client = IntentClient::new(Arc::new(MemoryStore::new()));
        let key = Key {
            name: "cr".into(),
            val: "a2V5".into(),
        };
        for (cluster, tree) in [("c1", "t1"), ("c2", "t1"), ("c1", "t10")] {
            client
                .save_key(&Key::store_key("ca1", cluster, "p1", tree), &key)
                .await
                .unwrap();
        }
        let paths = client.key_paths("ca1", "t1").await.unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.ends_with("/context/t1/key")));
    }
}
