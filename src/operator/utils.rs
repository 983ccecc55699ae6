use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{OrchestratorContext, Submission};
use crate::appcontext::StatusReport;
use crate::error::Error;
use crate::intent::{default_namespace, CertKey, ClusterGroupSpec, GroupScope, LifecycleKey, Scope};
use crate::rsync::NotificationStream;
use crate::state::{Event, LifecycleState, StateKey, Verification};

/// A concrete cluster a certificate is orchestrated for
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Target {
    pub provider: String,
    pub cluster: String,
    /// Namespace workloads run in on that cluster
    pub namespace: String,
}

/// Resolve every cluster group of `key` into concrete clusters.
///
/// Label groups are resolved against the inventory on every call. Any group
/// failing to resolve fails the whole resolution.
pub async fn resolve_targets(
    ctx: &OrchestratorContext,
    key: &CertKey,
) -> Result<Vec<Target>, Error> {
    let groups = ctx.intents.list_cluster_groups(key).await?;
    if groups.is_empty() {
        return Err(Error::not_found(format!("cert {} has no cluster groups", key)));
    }

    let mut targets: Vec<Target> = Vec::new();
    for group in groups {
        let resolved: Vec<Target> = match (&group.spec, &key.scope) {
            (
                ClusterGroupSpec::Provider {
                    scope,
                    provider,
                    cluster,
                    label,
                },
                _,
            ) => {
                let clusters = match scope {
                    GroupScope::Name => vec![cluster.clone().ok_or_else(|| {
                        Error::not_found(format!("cluster group {} names no cluster", group.name))
                    })?],
                    GroupScope::Label => {
                        let label = label.as_deref().ok_or_else(|| {
                            Error::not_found(format!("cluster group {} has no label", group.name))
                        })?;
                        ctx.inventory.clusters_by_label(provider, label).await?
                    }
                };
                clusters
                    .into_iter()
                    .map(|cluster| Target {
                        provider: provider.clone(),
                        cluster,
                        namespace: default_namespace(),
                    })
                    .collect()
            }
            (ClusterGroupSpec::LogicalCloud { logical_cloud }, Scope::LogicalCloud { project, .. }) => {
                let lc = ctx.intents.get_logical_cloud(project, logical_cloud).await?;
                lc.cluster_references
                    .into_iter()
                    .map(|r| Target {
                        provider: r.provider,
                        cluster: r.cluster,
                        namespace: lc.namespace.clone(),
                    })
                    .collect()
            }
            (ClusterGroupSpec::LogicalCloud { logical_cloud }, Scope::ClusterProvider { .. }) => {
                return Err(Error::not_found(format!(
                    "cluster group {} references logical cloud {} outside a project",
                    group.name, logical_cloud
                )))
            }
        };

        for target in resolved {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    if targets.is_empty() {
        return Err(Error::not_found(format!("no clusters resolved for cert {}", key)));
    }
    info!(cert = %key, clusters = targets.len(), "cluster groups resolved");
    Ok(targets)
}

/// How a built tree reaches the synchronizer
#[derive(Clone, Debug)]
pub enum Submit {
    Install,
    /// Replace the resources of a running tree
    Update { from_tree: String },
}

/// Claim the lifecycle for `tree_id`, open the ready feed and hand the tree
/// to the synchronizer.
///
/// On failure after the claim the lifecycle is left in a state that can be
/// retried: a failed install is recorded as InstantiateFailed, a failed update
/// restores the previous tree.
pub async fn submit_tree(
    ctx: &OrchestratorContext,
    key: &LifecycleKey,
    verification: &Verification,
    tree_id: &str,
    submit: &Submit,
) -> Result<NotificationStream, Error> {
    ctx.state
        .claim(key, verification, LifecycleState::Instantiating, tree_id)
        .await?;

    let result = async {
        let stream = ctx.watcher().subscribe(tree_id).await?;
        match submit {
            Submit::Install => ctx.installer.install_app(tree_id).await?,
            Submit::Update { from_tree } => {
                let outcome = ctx.installer.update_app(from_tree, tree_id).await?;
                if !outcome.updated {
                    return Err(Error::Rejected(format!(
                        "update from tree {} to {}: {}",
                        from_tree, tree_id, outcome.message
                    )));
                }
            }
        }
        Ok::<NotificationStream, Error>(stream)
    }
    .await;

    match result {
        Ok(stream) => {
            info!(tree = %tree_id, lifecycle = %key.event_name(), "tree submitted");
            Ok(stream)
        }
        Err(e) => {
            error!(tree = %tree_id, error = %e, "unable to submit tree");
            match submit {
                Submit::Install => mark_failed(ctx, key, tree_id).await,
                Submit::Update { from_tree } => {
                    if let Err(restore) = ctx
                        .state
                        .update_state(key, LifecycleState::Instantiated, from_tree, false)
                        .await
                    {
                        warn!(tree = %from_tree, error = %restore, "unable to restore previous tree");
                    }
                    ctx.contexts.delete_best_effort(tree_id).await;
                }
            }
            Err(e)
        }
    }
}

/// Record a failed run in both the lifecycle record and the tree status
pub async fn mark_failed(ctx: &OrchestratorContext, key: &LifecycleKey, tree_id: &str) {
    if let Err(e) = ctx
        .state
        .update_state(key, LifecycleState::InstantiateFailed, tree_id, false)
        .await
    {
        warn!(tree = %tree_id, error = %e, "unable to record failed state");
    }
    if let Err(e) = ctx
        .contexts
        .set_status(tree_id, LifecycleState::InstantiateFailed)
        .await
    {
        warn!(tree = %tree_id, error = %e, "unable to mark tree failed");
    }
}

/// Await the synchronizer for `tree_id` in a detached task, run `finish`
/// and record the state it returns. Any failure marks the run failed.
pub fn spawn_watch<F, Fut>(
    ctx: &OrchestratorContext,
    key: &LifecycleKey,
    tree_id: &str,
    stream: NotificationStream,
    finish: F,
) -> Submission
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<LifecycleState, Error>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let ctx = ctx.clone();
    let key = key.clone();
    let id = tree_id.to_string();

    let completion = tokio::spawn(async move {
        let result = async {
            ctx.watcher()
                .await_completion(&id, stream, &task_cancel)
                .await?;
            let state = finish(task_cancel.clone()).await?;
            ctx.state.update_state(&key, state, &id, false).await?;
            Ok::<LifecycleState, Error>(state)
        }
        .await;

        match result {
            Ok(state) => {
                info!(tree = %id, lifecycle = %key.event_name(), state = %state, "run complete");
                Ok(())
            }
            Err(e) => {
                error!(tree = %id, lifecycle = %key.event_name(), error = %e, "run failed");
                mark_failed(&ctx, &key, &id).await;
                Err(e)
            }
        }
    });

    Submission {
        tree_id: tree_id.to_string(),
        completion,
        cancel,
    }
}

/// Uninstall the live tree of a lifecycle. Returns the terminated tree id.
pub async fn terminate(ctx: &OrchestratorContext, key: &LifecycleKey) -> Result<String, Error> {
    let verification = ctx.state.verify_state(key, Event::Terminate).await?;
    let tree_id = verification.last_tree_id.clone().ok_or_else(|| {
        Error::not_found(format!("{} has not been instantiated", key.event_name()))
    })?;

    ctx.state
        .claim(key, &verification, LifecycleState::Terminating, &tree_id)
        .await?;
    if let Err(e) = ctx.installer.uninstall_app(&tree_id).await {
        error!(tree = %tree_id, error = %e, "uninstall failed");
        if let Err(record) = ctx
            .state
            .update_state(key, LifecycleState::TerminateFailed, &tree_id, false)
            .await
        {
            warn!(tree = %tree_id, error = %record, "unable to record failed termination");
        }
        return Err(e);
    }
    ctx.state
        .update_state(key, LifecycleState::Terminated, &tree_id, false)
        .await?;
    info!(tree = %tree_id, lifecycle = %key.event_name(), "terminated");
    Ok(tree_id)
}

/// Check that the live tree of a lifecycle may be updated. Returns the
/// observed record and the tree being replaced.
pub async fn prepare_update(
    ctx: &OrchestratorContext,
    key: &LifecycleKey,
) -> Result<(Verification, String), Error> {
    let verification = ctx.state.observe(key).await?;
    let from_tree = verification.last_tree_id.clone().ok_or_else(|| {
        Error::not_found(format!("{} has not been instantiated", key.event_name()))
    })?;
    match ctx.contexts.status(&from_tree).await? {
        Some(LifecycleState::Instantiated) | Some(LifecycleState::Updated) => {
            Ok((verification, from_tree))
        }
        other => Err(Error::conflict(format!(
            "{} can only be updated once instantiated, tree {} is {}",
            key.event_name(),
            from_tree,
            other.map_or("gone".to_string(), |s| s.to_string())
        ))),
    }
}

pub async fn status(ctx: &OrchestratorContext, key: &LifecycleKey) -> Result<StatusReport, Error> {
    let info = ctx.state.state_info(key).await?;
    let tree_id = info.status_ctx_id().ok_or_else(|| {
        Error::not_found(format!("{} has not been instantiated", key.event_name()))
    })?;
    ctx.status_reader()
        .report(tree_id, key.lifecycle.app_name())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::intent::{ClusterGroup, ClusterReference, LogicalCloud};
    use crate::inventory::{ClusterInventory, MockClusterInventory};
    use crate::rsync::{MockAppInstaller, MockReadyNotifier, UpdateOutcome};
    use crate::state::Lifecycle;
    use crate::store::MemoryStore;
    use futures::{stream, StreamExt};
    use mockall::predicate::*;
    use std::sync::Arc;

    fn context(
        installer: MockAppInstaller,
        notifier: MockReadyNotifier,
        inventory: impl ClusterInventory + 'static,
    ) -> OrchestratorContext {
        OrchestratorContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(installer),
            Arc::new(notifier),
            Arc::new(inventory),
            Settings::default(),
        )
    }

    fn idle() -> OrchestratorContext {
        context(
            MockAppInstaller::new(),
            MockReadyNotifier::new(),
            MockClusterInventory::new(),
        )
    }

    #[tokio::test]
    async fn name_and_label_groups_resolve_without_duplicates() {
        let mut inventory = MockClusterInventory::new();
        inventory
            .expect_clusters_by_label()
            .with(eq("p1"), eq("edge"))
            .times(1)
            .returning(|_, _| Ok(vec!["c1".into(), "c2".into()]));
        let ctx = context(MockAppInstaller::new(), MockReadyNotifier::new(), inventory);
        let key = CertKey::new("ca1", Scope::provider("p1"));
        ctx.intents
            .create_cluster_group(&key, &ClusterGroup::by_name("a", "p1", "c1"))
            .await
            .unwrap();
        ctx.intents
            .create_cluster_group(&key, &ClusterGroup::by_label("b", "p1", "edge"))
            .await
            .unwrap();

        let targets = resolve_targets(&ctx, &key).await.unwrap();
        let names: Vec<&str> = targets.iter().map(|t| t.cluster.as_str()).collect();
        assert_eq!(names, vec!["c1", "c2"]);
        assert!(targets.iter().all(|t| t.namespace == "default"));
    }

    #[tokio::test]
    async fn logical_cloud_groups_carry_namespace() {
        let ctx = idle();
        let key = CertKey::new("ca1", Scope::logical_cloud("proj", "lc1"));
        ctx.intents
            .create_logical_cloud(&LogicalCloud {
                name: "lc1".into(),
                project: "proj".into(),
                namespace: "edge-ns".into(),
                cluster_references: vec![ClusterReference {
                    provider: "p1".into(),
                    cluster: "c1".into(),
                }],
            })
            .await
            .unwrap();
        ctx.intents
            .create_cluster_group(
                &key,
                &ClusterGroup {
                    name: "lc".into(),
                    spec: ClusterGroupSpec::LogicalCloud {
                        logical_cloud: "lc1".into(),
                    },
                },
            )
            .await
            .unwrap();

        let targets = resolve_targets(&ctx, &key).await.unwrap();
        assert_eq!(
            targets,
            vec![Target {
                provider: "p1".into(),
                cluster: "c1".into(),
                namespace: "edge-ns".into(),
            }]
        );
    }

    #[tokio::test]
    async fn failing_label_query_fails_resolution() {
        let mut inventory = MockClusterInventory::new();
        inventory
            .expect_clusters_by_label()
            .returning(|_, _| Err(Error::not_found("provider p1")));
        let ctx = context(MockAppInstaller::new(), MockReadyNotifier::new(), inventory);
        let key = CertKey::new("ca1", Scope::provider("p1"));
        ctx.intents
            .create_cluster_group(&key, &ClusterGroup::by_name("a", "p1", "c1"))
            .await
            .unwrap();
        ctx.intents
            .create_cluster_group(&key, &ClusterGroup::by_label("b", "p1", "edge"))
            .await
            .unwrap();
        assert!(resolve_targets(&ctx, &key).await.is_err());
    }

    #[tokio::test]
    async fn no_groups_is_not_found() {
        let ctx = idle();
        let key = CertKey::new("ca1", Scope::provider("p1"));
        assert!(matches!(
            resolve_targets(&ctx, &key).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejected_install_marks_run_failed() {
        let mut installer = MockAppInstaller::new();
        installer
            .expect_install_app()
            .returning(|_| Err(Error::Rejected("no clusters".into())));
        let mut notifier = MockReadyNotifier::new();
        notifier
            .expect_alert()
            .returning(|_, _| Ok(stream::pending().boxed()));
        let ctx = context(installer, notifier, MockClusterInventory::new());
        let key = CertKey::new("ca1", Scope::provider("p1")).lifecycle(Lifecycle::Enrollment);
        ctx.state.create(&key).await.unwrap();
        let verification = ctx.state.verify_state(&key, Event::Instantiate).await.unwrap();

        let err = submit_tree(&ctx, &key, &verification, "t1", &Submit::Install)
            .await
            .err().expect("expected submit_tree to fail");
        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(
            ctx.state.current_state(&key).await.unwrap(),
            Some(LifecycleState::InstantiateFailed)
        );
    }

    #[tokio::test]
    async fn refused_update_restores_previous_tree() {
        let mut installer = MockAppInstaller::new();
        installer
            .expect_update_app()
            .with(eq("old"), eq("new"))
            .returning(|_, _| {
                Ok(UpdateOutcome {
                    updated: false,
                    message: "cluster unreachable".into(),
                })
            });
        let mut notifier = MockReadyNotifier::new();
        notifier
            .expect_alert()
            .returning(|_, _| Ok(stream::pending().boxed()));
        let ctx = context(installer, notifier, MockClusterInventory::new());
        let key = CertKey::new("ca1", Scope::provider("p1")).lifecycle(Lifecycle::Enrollment);
        ctx.state
            .update_state(&key, LifecycleState::Instantiated, "old", true)
            .await
            .unwrap();
        let verification = ctx.state.observe(&key).await.unwrap();

        let submit = Submit::Update {
            from_tree: "old".into(),
        };
        let err = submit_tree(&ctx, &key, &verification, "new", &submit)
            .await
            .err().expect("expected submit_tree to fail");
        assert!(err.to_string().contains("cluster unreachable"));
        let info = ctx.state.state_info(&key).await.unwrap();
        assert_eq!(info.status_ctx_id(), Some("old"));
        assert_eq!(
            info.last_action().map(|a| a.state),
            Some(LifecycleState::Instantiated)
        );
    }

    #[tokio::test]
    async fn watch_failure_is_recorded() {
        let mut notifier = MockReadyNotifier::new();
        notifier.expect_unsubscribe().returning(|_, _| Ok(()));
        let ctx = context(MockAppInstaller::new(), notifier, MockClusterInventory::new());
        let key = CertKey::new("ca1", Scope::provider("p1")).lifecycle(Lifecycle::Distribution);
        ctx.state
            .update_state(&key, LifecycleState::Instantiating, "t1", true)
            .await
            .unwrap();

        let feed = stream::iter(vec![Err(tonic::Status::internal("boom"))]).boxed();
        let submission = spawn_watch(&ctx, &key, "t1", feed, |_| async {
            Ok::<LifecycleState, Error>(LifecycleState::Instantiated)
        });
        assert!(submission.wait().await.is_err());
        assert_eq!(
            ctx.state.current_state(&key).await.unwrap(),
            Some(LifecycleState::InstantiateFailed)
        );
    }

    #[tokio::test]
    async fn terminate_without_a_run_is_not_found() {
        let ctx = idle();
        let key = CertKey::new("ca1", Scope::provider("p1")).lifecycle(Lifecycle::Enrollment);
        ctx.state.create(&key).await.unwrap();
        assert!(matches!(
            terminate(&ctx, &key).await,
            Err(Error::NotFound(_))
        ));
    }
}
