use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::utils::{
    prepare_update, resolve_targets, spawn_watch, status, submit_tree, terminate, Submit, Target,
};
use super::{Operation, OrchestratorContext, Outcome, Submission};
use crate::appcontext::{resource_node_name, ClusterRef, ResourceTreeBuilder};
use crate::certissuer::{
    certificate_request_name, cluster_issuer, cluster_issuer_name, mesh_patch, mesh_patch_name,
    proxy_config, proxy_config_name, secret_name, tls_secret, SERVICE_MESH_ISTIO,
};
use crate::crd::CertificateRequest;
use crate::error::Error;
use crate::intent::{default_namespace, Cert, CertKey, Key, LifecycleKey};
use crate::inventory::{CERT_KV, SERVICE_MESH_KEY};
use crate::rsync::NotificationStream;
use crate::state::{Event, Lifecycle, LifecycleState};

/// Signed requests of the enrollment tree distribution builds from
struct SignedEnrollment {
    tree_id: String,
    requests: BTreeMap<String, CertificateRequest>,
}

/// Installs the signed certificates on every target cluster, each behind a
/// ClusterIssuer of its own.
pub struct DistributionStage {
    ctx: OrchestratorContext,
    operation: Operation,
    key: CertKey,
}

impl DistributionStage {
    pub fn new(ctx: OrchestratorContext, operation: Operation, key: CertKey) -> DistributionStage {
        DistributionStage {
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
                Ok(Outcome::Terminated { tree_id })
            }
            Operation::Update => self.update().await,
            Operation::Status => Ok(Outcome::Status(
                status(&self.ctx, &self.lifecycle_key()).await?,
            )),
        }
    }

    fn lifecycle_key(&self) -> LifecycleKey {
        self.key.lifecycle(Lifecycle::Distribution)
    }

    async fn instantiate(&self) -> Result<Outcome, Error> {
        let cert = self.ctx.intents.get_cert(&self.key).await?;
        let key = self.lifecycle_key();
        let verification = self.ctx.state.verify_state(&key, Event::Instantiate).await?;
        let targets = resolve_targets(&self.ctx, &self.key).await?;
        let enrollment = self.signed_enrollment(&cert, &targets).await?;

        let tree_id = self.build(&cert, &targets, &enrollment).await?;
        let stream = match submit_tree(&self.ctx, &key, &verification, &tree_id, &Submit::Install).await
        {
            Ok(stream) => stream,
            Err(e @ Error::Conflict(_)) => {
                self.ctx.contexts.delete_best_effort(&tree_id).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        Ok(Outcome::Submitted(self.watch(&key, &tree_id, stream, None)))
    }

    async fn update(&self) -> Result<Outcome, Error> {
        let cert = self.ctx.intents.get_cert(&self.key).await?;
        let key = self.lifecycle_key();
        let (verification, from_tree) = prepare_update(&self.ctx, &key).await?;
        let targets = resolve_targets(&self.ctx, &self.key).await?;
        let enrollment = self.signed_enrollment(&cert, &targets).await?;

        let tree_id = self.build(&cert, &targets, &enrollment).await?;
        let submit = Submit::Update {
            from_tree: from_tree.clone(),
        };
        let stream = match submit_tree(&self.ctx, &key, &verification, &tree_id, &submit).await {
            Ok(stream) => stream,
            Err(e) => {
                self.ctx.contexts.delete_best_effort(&tree_id).await;
                return Err(e);
            }
        };

        Ok(Outcome::Submitted(self.watch(
            &key,
            &tree_id,
            stream,
            Some(from_tree),
        )))
    }

    fn watch(
        &self,
        key: &LifecycleKey,
        tree_id: &str,
        stream: NotificationStream,
        superseded: Option<String>,
    ) -> Submission {
        let ctx = self.ctx.clone();
        let id = tree_id.to_string();
        spawn_watch(&self.ctx, key, tree_id, stream, move |cancel| async move {
            finish(&ctx, &id, superseded, &cancel).await
        })
    }

    /// Check the enrollment is complete and collect its signed requests.
    ///
    /// The enrollment tree must be deployed, every cluster reachable and
    /// every request ready, and there must be exactly one signed request per
    /// target cluster.
    async fn signed_enrollment(
        &self,
        cert: &Cert,
        targets: &[Target],
    ) -> Result<SignedEnrollment, Error> {
        let enrollment = self.key.lifecycle(Lifecycle::Enrollment);
        let info = self.ctx.state.state_info(&enrollment).await?;
        let tree_id = info
            .status_ctx_id()
            .ok_or_else(|| Error::not_ready("Enrollment is not ready"))?
            .to_string();

        match self.ctx.contexts.status(&tree_id).await? {
            Some(LifecycleState::Instantiated) | Some(LifecycleState::Updated) => {}
            other => {
                return Err(Error::not_ready(format!(
                    "Enrollment is not ready: tree {} is {}",
                    tree_id,
                    other.map_or("gone".to_string(), |s| s.to_string())
                )))
            }
        }

        let app = Lifecycle::Enrollment.app_name();
        let reader = self.ctx.status_reader();
        let ready = reader
            .report(&tree_id, app)
            .await?
            .validate_ready()
            .map_err(|e| match e {
                Error::NotReady(detail) => {
                    Error::not_ready(format!("Enrollment is not ready: {}", detail))
                }
                other => other,
            })?;

        let tree = self.ctx.contexts.load(&tree_id).await?;
        let app_handle = tree
            .app(app)
            .ok_or_else(|| Error::not_found(format!("app {} in tree {}", app, tree_id)))?;
        let issuer = ClusterRef {
            provider: cert.spec.issuing_cluster.cluster_provider.clone(),
            cluster: cert.spec.issuing_cluster.cluster.clone(),
        };
        let expected: Vec<String> = tree
            .clusters(app_handle)
            .into_iter()
            .filter(|(_, cluster)| *cluster == issuer)
            .flat_map(|(handle, _)| tree.resource_names(handle))
            .collect();
        let requests = reader
            .certificate_requests(&tree_id, app, &issuer, &expected)
            .await?;

        if ready != requests.len() || requests.len() != targets.len() {
            warn!(
                tree = %tree_id,
                ready = ready,
                signed = requests.len(),
                clusters = targets.len(),
                "enrollment readiness does not match the target clusters"
            );
            return Err(Error::not_ready("Enrollment is not ready"));
        }
        Ok(SignedEnrollment { tree_id, requests })
    }

    async fn build(
        &self,
        cert: &Cert,
        targets: &[Target],
        enrollment: &SignedEnrollment,
    ) -> Result<String, Error> {
        let mut builder = ResourceTreeBuilder::init(
            self.ctx.contexts.clone(),
            Lifecycle::Distribution.app_name(),
        )
        .await?;
        let tree_id = builder.tree_id().to_string();

        for target in targets {
            if let Err(e) = self.add_target(&mut builder, cert, target, enrollment).await {
                builder.rollback().await;
                return Err(e);
            }
        }
        debug!(tree = %tree_id, clusters = targets.len(), "distribution tree built");
        Ok(tree_id)
    }

    async fn add_target(
        &self,
        builder: &mut ResourceTreeBuilder,
        cert: &Cert,
        target: &Target,
        enrollment: &SignedEnrollment,
    ) -> Result<(), Error> {
        let cluster = builder
            .add_cluster_node(&target.provider, &target.cluster)
            .await?;

        let request_name = certificate_request_name(
            &enrollment.tree_id,
            &cert.name,
            &target.provider,
            &target.cluster,
        );
        let signed = enrollment.requests.get(&request_name).ok_or_else(|| {
            Error::not_ready(format!(
                "certificate request {} not ready, update the enrollment",
                request_name
            ))
        })?;
        let private_key = self
            .ctx
            .intents
            .get_key(&Key::store_key(
                &cert.name,
                &target.cluster,
                &target.provider,
                &enrollment.tree_id,
            ))
            .await?;

        let mut order: Vec<String> = Vec::new();

        let secret = secret_name(&cert.name, &target.provider, &target.cluster);
        let node = resource_node_name(&secret, "Secret");
        builder
            .add_resource(cluster, &node, &tls_secret(&secret, signed, &private_key)?)
            .await?;
        order.push(node);

        let issuer = cluster_issuer_name(&cert.name, &target.provider, &target.cluster);
        let node = resource_node_name(&issuer, "ClusterIssuer");
        builder
            .add_resource(cluster, &node, &cluster_issuer(&issuer, &secret))
            .await?;
        order.push(node);

        if target.namespace != default_namespace() {
            let pc = proxy_config_name(&cert.name, &target.provider, &target.cluster);
            let node = resource_node_name(&pc, "ProxyConfig");
            builder
                .add_resource(cluster, &node, &proxy_config(&pc, &target.namespace, &issuer))
                .await?;
            order.push(node);

            let mesh = self
                .ctx
                .inventory
                .cluster_kv(&target.provider, &target.cluster, CERT_KV, SERVICE_MESH_KEY)
                .await?
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| SERVICE_MESH_ISTIO.to_string());
            let name = mesh_patch_name(&cert.name, &target.provider, &target.cluster, &mesh);
            match mesh_patch(&name, &mesh, &issuer, signed)? {
                Some(patch) => {
                    let node = resource_node_name(&name, "Config");
                    builder.add_resource(cluster, &node, &patch).await?;
                    order.push(node);
                }
                None => warn!(
                    cluster = %target.cluster,
                    mesh = %mesh,
                    "no configuration patch known for service mesh"
                ),
            }
        }

        builder.add_order_instruction(cluster, &order).await?;
        info!(
            provider = %target.provider,
            cluster = %target.cluster,
            resources = order.len(),
            "distribution resources added"
        );
        Ok(())
    }
}

/// Final state of a ready distribution tree. An update removes the tree it
/// superseded; a cancelled run leaves it in place.
async fn finish(
    ctx: &OrchestratorContext,
    tree_id: &str,
    superseded: Option<String>,
    cancel: &CancellationToken,
) -> Result<LifecycleState, Error> {
    let cancelled = || Error::Cancelled(format!("distribution of tree {}", tree_id));
    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    match superseded {
        Some(old) => {
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = ctx.contexts.delete_best_effort(&old) => {}
            }
            Ok(LifecycleState::Updated)
        }
        None => Ok(LifecycleState::Instantiated),
    }
}
