//! Enrollment and distribution stages.
//!
//! A stage is built for one (cert, scope) and one [`Operation`]. Instantiate
//! and Update return once the tree is handed to the synchronizer; the rest
//! runs in a detached task whose handle is returned as a [`Submission`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::appcontext::{AppContextClient, StatusBundleReader, StatusReport};
use crate::config::Settings;
use crate::error::Error;
use crate::intent::{Cert, CertKey, ClusterGroup, IntentClient};
use crate::inventory::ClusterInventory;
use crate::rsync::{AppInstaller, NotificationWatcher, ReadyNotifier};
use crate::state::{Lifecycle, StateClient};
use crate::store::ResourceStore;

mod distribution;
mod enrollment;
mod utils;

pub use distribution::DistributionStage;
pub use enrollment::EnrollmentStage;
pub use utils::{resolve_targets, Target};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operation {
    Instantiate,
    Terminate,
    Update,
    Status,
}

/// Collaborators shared by every stage
#[derive(Clone)]
pub struct OrchestratorContext {
    pub intents: IntentClient,
    pub contexts: AppContextClient,
    pub state: StateClient,
    pub installer: Arc<dyn AppInstaller>,
    pub notifier: Arc<dyn ReadyNotifier>,
    pub inventory: Arc<dyn ClusterInventory>,
    pub settings: Settings,
}

impl OrchestratorContext {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        installer: Arc<dyn AppInstaller>,
        notifier: Arc<dyn ReadyNotifier>,
        inventory: Arc<dyn ClusterInventory>,
        settings: Settings,
    ) -> OrchestratorContext {
        let contexts = AppContextClient::new(store.clone());
        OrchestratorContext {
            intents: IntentClient::new(store.clone()),
            state: StateClient::new(store, contexts.clone()),
            contexts,
            installer,
            notifier,
            inventory,
            settings,
        }
    }

    pub fn watcher(&self) -> NotificationWatcher {
        NotificationWatcher::new(
            self.notifier.clone(),
            self.settings.client_name.clone(),
            self.settings.watch.clone(),
        )
    }

    pub fn status_reader(&self) -> StatusBundleReader {
        StatusBundleReader::new(self.contexts.clone())
    }

    /// Store a cert intent with its cluster groups and empty lifecycle records
    pub async fn create_cert(
        &self,
        key: &CertKey,
        cert: &Cert,
        groups: &[ClusterGroup],
    ) -> Result<(), Error> {
        self.intents.create_cert(key, cert).await?;
        for group in groups {
            self.intents.create_cluster_group(key, group).await?;
        }
        for lifecycle in [Lifecycle::Enrollment, Lifecycle::Distribution] {
            match self.state.create(&key.lifecycle(lifecycle)).await {
                Ok(()) | Err(Error::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(cert = %key, groups = groups.len(), "cert intent created");
        Ok(())
    }

    /// Remove a cert intent; both lifecycles must be terminated or never run
    pub async fn delete_cert(&self, key: &CertKey) -> Result<(), Error> {
        let enrollment = key.lifecycle(Lifecycle::Enrollment);
        let distribution = key.lifecycle(Lifecycle::Distribution);
        self.state
            .ensure_deletable(&[&distribution, &enrollment])
            .await?;

        for group in self.intents.list_cluster_groups(key).await? {
            self.intents.delete_cluster_group(key, &group.name).await?;
        }
        // every tree either lifecycle recorded
        for lifecycle in [&distribution, &enrollment] {
            let info = match self.state.state_info(lifecycle).await {
                Ok(info) => info,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let trees: BTreeSet<&str> = info.actions.iter().map(|a| a.instance.as_str()).collect();
            for tree_id in trees {
                self.contexts.delete(tree_id).await?;
                debug!(cert = %key, tree = %tree_id, "resource tree deleted");
            }
        }
        self.state.delete(&distribution).await?;
        self.state.delete(&enrollment).await?;
        self.intents.delete_cert(key).await?;
        info!(cert = %key, "cert intent deleted");
        Ok(())
    }
}

/// A tree handed to the synchronizer, completing in the background
#[derive(Debug)]
pub struct Submission {
    pub tree_id: String,
    pub completion: JoinHandle<Result<(), Error>>,
    pub cancel: CancellationToken,
}

impl Submission {
    /// Wait for the background task to record its final state
    pub async fn wait(self) -> Result<(), Error> {
        self.completion.await?
    }

    /// Stop waiting; the run is recorded as failed
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
pub enum Outcome {
    Submitted(Submission),
    Terminated { tree_id: String },
    Status(StatusReport),
}

impl Outcome {
    pub fn tree_id(&self) -> &str {
        match self {
            Outcome::Submitted(submission) => &submission.tree_id,
            Outcome::Terminated { tree_id } => tree_id,
            Outcome::Status(report) => &report.tree_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{CertSpec, Scope};
    use crate::inventory::MockClusterInventory;
    use crate::rsync::{MockAppInstaller, MockReadyNotifier};
    use crate::state::{LifecycleState, StateKey};
    use crate::store::MemoryStore;

    fn context() -> OrchestratorContext {
        OrchestratorContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockAppInstaller::new()),
            Arc::new(MockReadyNotifier::new()),
            Arc::new(MockClusterInventory::new()),
            Settings::default(),
        )
    }

    fn cert() -> Cert {
        Cert {
            name: "ca1".into(),
            description: None,
            spec: CertSpec::default(),
        }
    }

    #[tokio::test]
    async fn create_cert_prepares_both_lifecycles() {
        let ctx = context();
        let key = CertKey::new("ca1", Scope::provider("p1"));
        ctx.create_cert(&key, &cert(), &[ClusterGroup::by_name("g", "p1", "c1")])
            .await
            .unwrap();

        for lifecycle in [Lifecycle::Enrollment, Lifecycle::Distribution] {
            assert_eq!(
                ctx.state
                    .current_state(&key.lifecycle(lifecycle))
                    .await
                    .unwrap(),
                None
            );
        }
        assert_eq!(ctx.intents.list_cluster_groups(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_cert_refuses_running_lifecycles() {
        let ctx = context();
        let key = CertKey::new("ca1", Scope::provider("p1"));
        ctx.create_cert(&key, &cert(), &[]).await.unwrap();
        let enrollment = key.lifecycle(Lifecycle::Enrollment);
        ctx.state
            .update_state(&enrollment, LifecycleState::Instantiated, "t1", false)
            .await
            .unwrap();

        assert!(matches!(ctx.delete_cert(&key).await, Err(Error::Conflict(_))));

        ctx.state
            .update_state(&enrollment, LifecycleState::Terminated, "t1", false)
            .await
            .unwrap();
        ctx.delete_cert(&key).await.unwrap();
        assert!(matches!(
            ctx.intents.get_cert(&key).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            ctx.state.state_info(&enrollment).await,
            Err(Error::NotFound(_))
        ));
        assert!(enrollment.store_key().ends_with("cert-enrollment/stateInfo"));
    }
}
