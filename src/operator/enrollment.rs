use tracing::{debug, info, warn};

use super::utils::{
    prepare_update, resolve_targets, spawn_watch, status, submit_tree, terminate, Submit, Target,
};
use super::{Operation, OrchestratorContext, Outcome, Submission};
use crate::appcontext::{resource_node_name, ClusterRef, ResourceTreeBuilder};
use crate::certissuer::{certificate_request, certificate_request_name, common_name, generate_csr};
use crate::error::Error;
use crate::intent::{Cert, CertKey, Key, LifecycleKey};
use crate::inventory::{CERT_KV, COMMON_NAME_KEY};
use crate::rsync::NotificationStream;
use crate::state::{Event, Lifecycle, LifecycleState};

const REQUEST_KIND: &str = "CertificateRequest";

/// A submitted-ready enrollment tree
struct EnrollmentTree {
    tree_id: String,
    issuer: ClusterRef,
    /// Resource node names of the CertificateRequests, one per target
    expected: Vec<String>,
}

/// Requests a signed certificate for every target cluster. All requests are
/// placed on the issuing cluster, which signs them.
pub struct EnrollmentStage {
    ctx: OrchestratorContext,
    operation: Operation,
    key: CertKey,
}

impl EnrollmentStage {
    pub fn new(ctx: OrchestratorContext, operation: Operation, key: CertKey) -> EnrollmentStage {
        EnrollmentStage {
            ctx,
            operation,
            key,
        }
    }

    pub async fn run(&self) -> Result<Outcome, Error> {
        match self.operation {
            Operation::Instantiate => self.instantiate().await,
            Operation::Terminate => {
                let tree_id = terminate(&self.ctx, &self.lifecycle_key()).await?;
                self.discard_keys(&tree_id).await;
                Ok(Outcome::Terminated { tree_id })
            }
            Operation::Update => self.update().await,
            Operation::Status => Ok(Outcome::Status(
                status(&self.ctx, &self.lifecycle_key()).await?,
            )),
        }
    }

    fn lifecycle_key(&self) -> LifecycleKey {
        self.key.lifecycle(Lifecycle::Enrollment)
    }

    async fn instantiate(&self) -> Result<Outcome, Error> {
        let cert = self.ctx.intents.get_cert(&self.key).await?;
        let key = self.lifecycle_key();
        let verification = self.ctx.state.verify_state(&key, Event::Instantiate).await?;
        let targets = resolve_targets(&self.ctx, &self.key).await?;

        let tree = self.build(&cert, &targets).await?;
        let stream =
            match submit_tree(&self.ctx, &key, &verification, &tree.tree_id, &Submit::Install).await
            {
                Ok(stream) => stream,
                Err(e @ Error::Conflict(_)) => {
                    // lost the claim, this run never existed
                    self.ctx.contexts.delete_best_effort(&tree.tree_id).await;
                    self.discard_keys(&tree.tree_id).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

        let submission = self.watch(&key, tree, stream, None);
        Ok(Outcome::Submitted(submission))
    }

    async fn update(&self) -> Result<Outcome, Error> {
        let cert = self.ctx.intents.get_cert(&self.key).await?;
        let key = self.lifecycle_key();
        let (verification, from_tree) = prepare_update(&self.ctx, &key).await?;
        let targets = resolve_targets(&self.ctx, &self.key).await?;

        let tree = self.build(&cert, &targets).await?;
        let submit = Submit::Update {
            from_tree: from_tree.clone(),
        };
        let stream = match submit_tree(&self.ctx, &key, &verification, &tree.tree_id, &submit).await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.ctx.contexts.delete_best_effort(&tree.tree_id).await;
                self.discard_keys(&tree.tree_id).await;
                return Err(e);
            }
        };

        let submission = self.watch(&key, tree, stream, Some(from_tree));
        Ok(Outcome::Submitted(submission))
    }

    /// Wait for every request to be signed. After an update the superseded
    /// tree and its keys are removed.
    fn watch(
        &self,
        key: &LifecycleKey,
        tree: EnrollmentTree,
        stream: NotificationStream,
        superseded: Option<String>,
    ) -> Submission {
        let ctx = self.ctx.clone();
        let cert = self.key.cert.clone();
        let tree_id = tree.tree_id.clone();
        spawn_watch(&self.ctx, key, &tree_id, stream, move |cancel| async move {
            let signed = ctx
                .status_reader()
                .await_certificate_requests(
                    &tree.tree_id,
                    Lifecycle::Enrollment.app_name(),
                    &tree.issuer,
                    &tree.expected,
                    &ctx.settings.poll,
                    &cancel,
                )
                .await?;
            info!(tree = %tree.tree_id, certificates = signed.len(), "certificate requests signed");

            let state = match superseded {
                Some(old) => {
                    for path in ctx.intents.key_paths(&cert, &old).await? {
                        ctx.intents.delete_key(&path).await?;
                    }
                    ctx.contexts.delete_best_effort(&old).await;
                    LifecycleState::Updated
                }
                None => LifecycleState::Instantiated,
            };
            Ok::<LifecycleState, Error>(state)
        })
    }

    /// Build the enrollment tree: one CertificateRequest per target, all
    /// under the issuing cluster. Private keys are stored as they are
    /// generated.
    async fn build(&self, cert: &Cert, targets: &[Target]) -> Result<EnrollmentTree, Error> {
        let mut builder =
            ResourceTreeBuilder::init(self.ctx.contexts.clone(), Lifecycle::Enrollment.app_name())
                .await?;
        let tree_id = builder.tree_id().to_string();

        match self.populate(&mut builder, cert, targets).await {
            Ok(tree) => {
                debug!(tree = %tree_id, requests = tree.expected.len(), "enrollment tree built");
                Ok(tree)
            }
            Err(e) => {
                builder.rollback().await;
                self.discard_keys(&tree_id).await;
                Err(e)
            }
        }
    }

    async fn populate(
        &self,
        builder: &mut ResourceTreeBuilder,
        cert: &Cert,
        targets: &[Target],
    ) -> Result<EnrollmentTree, Error> {
        let tree_id = builder.tree_id().to_string();
        let issuing = &cert.spec.issuing_cluster;
        let issuer = ClusterRef {
            provider: issuing.cluster_provider.clone(),
            cluster: issuing.cluster.clone(),
        };
        let cluster = builder
            .add_cluster_node(&issuer.provider, &issuer.cluster)
            .await?;

        let mut expected: Vec<String> = Vec::new();
        for target in targets {
            let name = certificate_request_name(&tree_id, &cert.name, &target.provider, &target.cluster);
            let kv_override = self
                .ctx
                .inventory
                .cluster_kv(&target.provider, &target.cluster, CERT_KV, COMMON_NAME_KEY)
                .await?;
            let cn = common_name(cert, &target.provider, &target.cluster, kv_override);

            let template = cert.clone();
            let key_size = self.ctx.settings.default_key_size;
            let csr =
                tokio::task::spawn_blocking(move || generate_csr(&template, &cn, key_size)).await??;

            let key_path = Key::store_key(&cert.name, &target.cluster, &target.provider, &tree_id);
            self.ctx
                .intents
                .save_key(&key_path, &csr.key_record(&name))
                .await?;

            let node = resource_node_name(&name, REQUEST_KIND);
            builder
                .add_resource(cluster, &node, &certificate_request(&name, cert, &csr.csr_pem))
                .await?;
            expected.push(node);
        }
        builder.add_order_instruction(cluster, &expected).await?;

        Ok(EnrollmentTree {
            tree_id,
            issuer,
            expected,
        })
    }

    /// Delete the private keys generated for `tree_id`; failures are logged
    async fn discard_keys(&self, tree_id: &str) {
        let paths = match self.ctx.intents.key_paths(&self.key.cert, tree_id).await {
            Ok(paths) => paths,
            Err(e) => {
                warn!(tree = %tree_id, error = %e, "unable to list private keys");
                return;
            }
        };
        for path in paths {
            if let Err(e) = self.ctx.intents.delete_key(&path).await {
                warn!(key = %path, error = %e, "unable to delete private key");
            }
        }
    }
}
