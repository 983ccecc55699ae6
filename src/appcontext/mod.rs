//! The resource tree (AppContext) consumed by the synchronizer.
//!
//! A tree is a small arena: one composite-app root, app nodes below it,
//! cluster nodes below apps and resource nodes below clusters. Order and
//! dependency instructions hang off the root (app level) and off cluster
//! nodes (resource level). Node handles are typed so a resource can only be
//! added under a cluster, and a cluster only under an app.
//!
//! The synchronizer writes its results back next to the tree: a top-level
//! status leaf, and per cluster a JSON status bundle and a connectivity leaf.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Error;
use crate::state::LifecycleState;
use crate::store::{get_typed, put_typed, ResourceStore};

pub mod builder;
pub mod status;

pub use builder::ResourceTreeBuilder;
pub use status::{
    ClusterReport, Connectivity, PollPolicy, ReadyStatus, ResourceStatusEntry, StatusBundle,
    StatusBundleReader, StatusReport,
};

pub const COMPOSITE_APP: &str = "ca-cert-composite-app";
const PREFIX: &str = "appcontext";

pub type NodeId = usize;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    CompositeApp,
    App,
    Cluster,
    Resource,
    Instruction,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum InstructionKind {
    Order,
    Dependency,
}

impl InstructionKind {
    fn node_name(&self) -> &'static str {
        match self {
            InstructionKind::Order => "order",
            InstructionKind::Dependency => "dependency",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub name: String,
    pub parent: Option<NodeId>,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct AppHandle(NodeId);

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClusterHandle(NodeId);

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ResourceHandle(NodeId);

/// Cluster node identity, stored as `provider+cluster`
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct ClusterRef {
    pub provider: String,
    pub cluster: String,
}

impl ClusterRef {
    pub fn node_name(&self) -> String {
        format!("{}+{}", self.provider, self.cluster)
    }

    pub fn parse(node_name: &str) -> Option<ClusterRef> {
        let (provider, cluster) = node_name.split_once('+')?;
        Some(ClusterRef {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
        })
    }
}

/// Name of a resource node: `name+Kind`
pub fn resource_node_name(name: &str, kind: &str) -> String {
    format!("{}+{}", name, kind)
}

/// Split a resource node name back into `(name, kind)`
pub fn split_resource_node_name(node_name: &str) -> Option<(&str, &str)> {
    node_name.rsplit_once('+')
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct ResourceTree {
    id: String,
    nodes: Vec<Node>,
}

impl ResourceTree {
    pub fn new(id: impl Into<String>) -> ResourceTree {
        ResourceTree {
            id: id.into(),
            nodes: vec![Node {
                kind: NodeKind::CompositeApp,
                name: COMPOSITE_APP.to_string(),
                parent: None,
                children: Vec::new(),
                value: None,
            }],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    fn children_of(&self, parent: NodeId, kind: NodeKind) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes
            .get(parent)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(move |id| {
                self.nodes
                    .get(*id)
                    .filter(|n| n.kind == kind)
                    .map(|n| (*id, n))
            })
    }

    fn push(
        &mut self,
        parent: NodeId,
        kind: NodeKind,
        name: &str,
        value: Option<Value>,
    ) -> Result<NodeId, Error> {
        if self.children_of(parent, kind).any(|(_, n)| n.name == name) {
            return Err(Error::build_failure(format!(
                "{:?} node {} already exists in tree {}",
                kind, name, self.id
            )));
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            kind,
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            value,
        });
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    pub fn add_app(&mut self, name: &str) -> Result<AppHandle, Error> {
        let root = self.root();
        self.push(root, NodeKind::App, name, None).map(AppHandle)
    }

    pub fn add_cluster(
        &mut self,
        app: AppHandle,
        provider: &str,
        cluster: &str,
    ) -> Result<ClusterHandle, Error> {
        let name = ClusterRef {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
        }
        .node_name();
        self.push(app.0, NodeKind::Cluster, &name, None)
            .map(ClusterHandle)
    }

    pub fn add_resource(
        &mut self,
        cluster: ClusterHandle,
        name: &str,
        manifest: Value,
    ) -> Result<ResourceHandle, Error> {
        self.push(cluster.0, NodeKind::Resource, name, Some(manifest))
            .map(ResourceHandle)
    }

    /// App-level instruction under the composite app
    pub fn add_app_instruction(
        &mut self,
        kind: InstructionKind,
        value: Value,
    ) -> Result<NodeId, Error> {
        let root = self.root();
        self.push(root, NodeKind::Instruction, kind.node_name(), Some(value))
    }

    /// Resource-level instruction under a cluster node
    pub fn add_resource_instruction(
        &mut self,
        cluster: ClusterHandle,
        kind: InstructionKind,
        value: Value,
    ) -> Result<NodeId, Error> {
        self.push(
            cluster.0,
            NodeKind::Instruction,
            kind.node_name(),
            Some(value),
        )
    }

    pub fn app(&self, name: &str) -> Option<AppHandle> {
        self.children_of(self.root(), NodeKind::App)
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| AppHandle(id))
    }

    pub fn clusters(&self, app: AppHandle) -> Vec<(ClusterHandle, ClusterRef)> {
        self.children_of(app.0, NodeKind::Cluster)
            .filter_map(|(id, n)| ClusterRef::parse(&n.name).map(|r| (ClusterHandle(id), r)))
            .collect()
    }

    pub fn cluster_names(&self, app: AppHandle) -> Vec<String> {
        self.children_of(app.0, NodeKind::Cluster)
            .map(|(_, n)| n.name.clone())
            .collect()
    }

    pub fn resource_names(&self, cluster: ClusterHandle) -> Vec<String> {
        self.children_of(cluster.0, NodeKind::Resource)
            .map(|(_, n)| n.name.clone())
            .collect()
    }

    pub fn resource_value(&self, resource: ResourceHandle) -> Option<&Value> {
        self.nodes.get(resource.0).and_then(|n| n.value.as_ref())
    }

    /// Manifest of the resource node `name` under `cluster`
    pub fn resource(&self, cluster: ClusterHandle, name: &str) -> Option<&Value> {
        self.children_of(cluster.0, NodeKind::Resource)
            .find(|(_, n)| n.name == name)
            .and_then(|(_, n)| n.value.as_ref())
    }

    pub fn app_instruction(&self, kind: InstructionKind) -> Option<&Value> {
        self.children_of(self.root(), NodeKind::Instruction)
            .find(|(_, n)| n.name == kind.node_name())
            .and_then(|(_, n)| n.value.as_ref())
    }

    pub fn resource_instruction(
        &self,
        cluster: ClusterHandle,
        kind: InstructionKind,
    ) -> Option<&Value> {
        self.children_of(cluster.0, NodeKind::Instruction)
            .find(|(_, n)| n.name == kind.node_name())
            .and_then(|(_, n)| n.value.as_ref())
    }
}

/// Reads and writes trees and their status leaves in the backing store
#[derive(Clone)]
pub struct AppContextClient {
    store: Arc<dyn ResourceStore>,
}

impl AppContextClient {
    pub fn new(store: Arc<dyn ResourceStore>) -> AppContextClient {
        AppContextClient { store }
    }

    fn tree_key(tree_id: &str) -> String {
        format!("{}/{}", PREFIX, tree_id)
    }

    fn status_key(tree_id: &str) -> String {
        format!("{}/{}/status", PREFIX, tree_id)
    }

    fn cluster_key(tree_id: &str, app: &str, cluster: &ClusterRef, leaf: &str) -> String {
        format!(
            "{}/{}/app/{}/cluster/{}/{}",
            PREFIX,
            tree_id,
            app,
            cluster.node_name(),
            leaf
        )
    }

    pub async fn save(&self, tree: &ResourceTree) -> Result<(), Error> {
        put_typed(self.store.as_ref(), &Self::tree_key(tree.id()), tree).await?;
        Ok(())
    }

    pub async fn load(&self, tree_id: &str) -> Result<ResourceTree, Error> {
        get_typed(self.store.as_ref(), &Self::tree_key(tree_id))
            .await?
            .ok_or_else(|| Error::not_found(format!("resource tree {}", tree_id)))
    }

    /// Deployment status of a tree, `None` when the tree does not exist
    pub async fn status(&self, tree_id: &str) -> Result<Option<LifecycleState>, Error> {
        if self.store.get(&Self::tree_key(tree_id)).await?.is_none() {
            return Ok(None);
        }
        Ok(get_typed(self.store.as_ref(), &Self::status_key(tree_id)).await?)
    }

    pub async fn set_status(&self, tree_id: &str, status: LifecycleState) -> Result<(), Error> {
        put_typed(self.store.as_ref(), &Self::status_key(tree_id), &status).await?;
        Ok(())
    }

    /// Raw status bundle JSON written by the synchronizer for one cluster
    pub async fn cluster_status(
        &self,
        tree_id: &str,
        app: &str,
        cluster: &ClusterRef,
    ) -> Result<Option<String>, Error> {
        let key = Self::cluster_key(tree_id, app, cluster, "status");
        match self.store.get(&key).await? {
            Some(record) => match record.value {
                Value::String(raw) => Ok(Some(raw)),
                other => Ok(Some(other.to_string())),
            },
            None => Ok(None),
        }
    }

    pub async fn set_cluster_status(
        &self,
        tree_id: &str,
        app: &str,
        cluster: &ClusterRef,
        bundle: &str,
    ) -> Result<(), Error> {
        let key = Self::cluster_key(tree_id, app, cluster, "status");
        self.store.upsert(&key, Value::String(bundle.into())).await?;
        Ok(())
    }

    pub async fn connectivity(
        &self,
        tree_id: &str,
        app: &str,
        cluster: &ClusterRef,
    ) -> Result<Option<String>, Error> {
        let key = Self::cluster_key(tree_id, app, cluster, "connectivity");
        Ok(get_typed(self.store.as_ref(), &key).await?)
    }

    pub async fn set_connectivity(
        &self,
        tree_id: &str,
        app: &str,
        cluster: &ClusterRef,
        connectivity: &str,
    ) -> Result<(), Error> {
        let key = Self::cluster_key(tree_id, app, cluster, "connectivity");
        put_typed(self.store.as_ref(), &key, &connectivity).await?;
        Ok(())
    }

    /// Delete a tree together with every leaf written next to it
    pub async fn delete(&self, tree_id: &str) -> Result<(), Error> {
        let prefix = format!("{}/", Self::tree_key(tree_id));
        for (key, _) in self.store.list(&prefix).await? {
            self.store.delete(&key).await?;
        }
        self.store.delete(&Self::tree_key(tree_id)).await?;
        Ok(())
    }

    /// Delete and only log failures; used on rollback paths
    pub async fn delete_best_effort(&self, tree_id: &str) {
        if let Err(e) = self.delete(tree_id).await {
            warn!(tree = %tree_id, error = %e, "unable to delete resource tree");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn enrollment_tree() -> (ResourceTree, ClusterHandle) {
        let mut tree = ResourceTree::new("100");
        let app = tree.add_app("cert-enrollment").unwrap();
        let cluster = tree.add_cluster(app, "p1", "issuer").unwrap();
        tree.add_resource(cluster, "a+CertificateRequest", json!({"kind": "CertificateRequest"}))
            .unwrap();
        tree.add_resource(cluster, "b+CertificateRequest", json!({"kind": "CertificateRequest"}))
            .unwrap();
        (tree, cluster)
    }

    #[test]
    fn resources_are_listed_in_insertion_order() {
        let (tree, cluster) = enrollment_tree();
        assert_eq!(
            tree.resource_names(cluster),
            vec!["a+CertificateRequest", "b+CertificateRequest"]
        );
        let app = tree.app("cert-enrollment").unwrap();
        assert_eq!(tree.cluster_names(app), vec!["p1+issuer"]);
        assert_eq!(
            tree.clusters(app)[0].1,
            ClusterRef {
                provider: "p1".into(),
                cluster: "issuer".into()
            }
        );
    }

    #[test]
    fn duplicate_resource_names_are_rejected() {
        let (mut tree, cluster) = enrollment_tree();
        let err = tree
            .add_resource(cluster, "a+CertificateRequest", json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::BuildFailure(_)));
    }

    #[test]
    fn instructions_do_not_show_up_as_resources() {
        let (mut tree, cluster) = enrollment_tree();
        tree.add_resource_instruction(
            cluster,
            InstructionKind::Order,
            json!({"resorder": ["a+CertificateRequest", "b+CertificateRequest"]}),
        )
        .unwrap();
        assert_eq!(tree.resource_names(cluster).len(), 2);
        assert_eq!(
            tree.resource_instruction(cluster, InstructionKind::Order),
            Some(&json!({"resorder": ["a+CertificateRequest", "b+CertificateRequest"]}))
        );
        assert_eq!(tree.resource_instruction(cluster, InstructionKind::Dependency), None);
    }

    #[test]
    fn resource_node_names_split_on_last_separator() {
        let name = resource_node_name("100-ca1-p1-c1-cr", "CertificateRequest");
        assert_eq!(
            split_resource_node_name(&name),
            Some(("100-ca1-p1-c1-cr", "CertificateRequest"))
        );
    }

    #[tokio::test]
    async fn delete_removes_tree_and_leaves_only() {
        let store = Arc::new(MemoryStore::new());
        let contexts = AppContextClient::new(store.clone());
        let (tree, _) = enrollment_tree();
        let other = ResourceTree::new("1000");
        let cluster = ClusterRef {
            provider: "p1".into(),
            cluster: "issuer".into(),
        };

        contexts.save(&tree).await.unwrap();
        contexts.save(&other).await.unwrap();
        contexts.set_status("100", LifecycleState::Instantiated).await.unwrap();
        contexts
            .set_cluster_status("100", "cert-enrollment", &cluster, "{}")
            .await
            .unwrap();

        contexts.delete("100").await.unwrap();
        assert_eq!(contexts.status("100").await.unwrap(), None);
        assert_eq!(store.keys().await, vec!["appcontext/1000"]);
    }

    #[tokio::test]
    async fn status_of_a_tree_survives_a_round_trip() {
        let contexts = AppContextClient::new(Arc::new(MemoryStore::new()));
        let (tree, _) = enrollment_tree();
        contexts.save(&tree).await.unwrap();
        assert_eq!(contexts.status("100").await.unwrap(), None);
        contexts.set_status("100", LifecycleState::Instantiating).await.unwrap();
        assert_eq!(
            contexts.status("100").await.unwrap(),
            Some(LifecycleState::Instantiating)
        );
        assert_eq!(contexts.load("100").await.unwrap(), tree);
    }
}
