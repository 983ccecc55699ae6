use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    AppContextClient, AppHandle, ClusterHandle, InstructionKind, ResourceHandle, ResourceTree,
};
use crate::error::Error;
use crate::state::LifecycleState;

/// Builds one orchestration run's tree, writing every addition through to
/// the store. Any failed addition deletes the whole tree.
pub struct ResourceTreeBuilder {
    contexts: AppContextClient,
    tree: ResourceTree,
    app: AppHandle,
}

impl ResourceTreeBuilder {
    /// Create a fresh tree holding a single app named `app_name`
    pub async fn init(
        contexts: AppContextClient,
        app_name: &str,
    ) -> Result<ResourceTreeBuilder, Error> {
        let mut tree = ResourceTree::new(Uuid::new_v4().simple().to_string());
        let app = tree.add_app(app_name)?;
        tree.add_app_instruction(InstructionKind::Order, json!({ "apporder": [app_name] }))?;
        tree.add_app_instruction(
            InstructionKind::Dependency,
            json!({ "appdependency": { app_name: "go" } }),
        )?;

        let builder = ResourceTreeBuilder {
            contexts,
            tree,
            app,
        };
        builder.commit().await?;
        if let Err(e) = builder
            .contexts
            .set_status(builder.tree_id(), LifecycleState::Created)
            .await
        {
            return Err(builder.fail(e).await);
        }
        debug!(tree = %builder.tree_id(), app = app_name, "resource tree created");
        Ok(builder)
    }

    pub fn tree_id(&self) -> &str {
        self.tree.id()
    }

    pub fn app(&self) -> AppHandle {
        self.app
    }

    pub fn tree(&self) -> &ResourceTree {
        &self.tree
    }

    async fn commit(&self) -> Result<(), Error> {
        match self.contexts.save(&self.tree).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn fail(&self, err: Error) -> Error {
        self.contexts.delete_best_effort(self.tree_id()).await;
        match err {
            Error::BuildFailure(_) => err,
            other => Error::build_failure(format!(
                "resource tree {}: {}",
                self.tree_id(),
                other
            )),
        }
    }

    pub async fn add_cluster_node(
        &mut self,
        provider: &str,
        cluster: &str,
    ) -> Result<ClusterHandle, Error> {
        let handle = match self.tree.add_cluster(self.app, provider, cluster) {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(e).await),
        };
        self.commit().await?;
        Ok(handle)
    }

    /// Add a manifest under `cluster`; it is stored as its YAML serialization
    pub async fn add_resource<T: Serialize>(
        &mut self,
        cluster: ClusterHandle,
        name: &str,
        manifest: &T,
    ) -> Result<ResourceHandle, Error> {
        let serialized = match serde_yaml::to_string(manifest) {
            Ok(s) => s,
            Err(e) => {
                return Err(self
                    .fail(Error::build_failure(format!(
                        "unable to serialize {}: {}",
                        name, e
                    )))
                    .await)
            }
        };
        let handle = match self
            .tree
            .add_resource(cluster, name, Value::String(serialized))
        {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(e).await),
        };
        self.commit().await?;
        Ok(handle)
    }

    /// Record apply order and dependencies for every resource of `cluster`.
    /// Call once per cluster, after all of its resources are added.
    pub async fn add_order_instruction(
        &mut self,
        cluster: ClusterHandle,
        resources: &[String],
    ) -> Result<(), Error> {
        let mut dependencies = Map::new();
        for name in resources {
            dependencies.insert(name.clone(), Value::String("go".into()));
        }
        let result = self
            .tree
            .add_resource_instruction(
                cluster,
                InstructionKind::Order,
                json!({ "resorder": resources }),
            )
            .and_then(|_| {
                self.tree.add_resource_instruction(
                    cluster,
                    InstructionKind::Dependency,
                    json!({ "resdependency": dependencies }),
                )
            });
        if let Err(e) = result {
            return Err(self.fail(e).await);
        }
        self.commit().await
    }

    /// Drop a tree that was built but will not be submitted
    pub async fn rollback(self) {
        warn!(tree = %self.tree_id(), "rolling back resource tree");
        self.contexts.delete_best_effort(self.tree_id()).await;
    }

    pub fn finish(self) -> ResourceTree {
        self.tree
    }
}
