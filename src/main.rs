use std::path::PathBuf;
use std::sync::Arc;

use ca_cert_orchestrator::config::Config;
use ca_cert_orchestrator::intent::{Cert, CertKey, ClusterGroup, LogicalCloud, Scope};
use ca_cert_orchestrator::inventory::StaticInventory;
use ca_cert_orchestrator::operator::{
    DistributionStage, EnrollmentStage, Operation, OrchestratorContext, Outcome,
};
use ca_cert_orchestrator::rsync::RsyncClient;
use clap::{Args, Parser, ValueEnum};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ca-cert-orchestrator")]
#[command(bin_name = "ca-cert-orchestrator")]
enum OrchestratorCli {
    /// Store a cert intent with its cluster groups
    Apply(ApplyArgs),
    Enrollment(LifecycleArgs),
    Distribution(LifecycleArgs),
    /// Remove a cert intent once both lifecycles are terminated
    DeleteCert(CertArgs),
}

#[derive(Args)]
struct CertArgs {
    #[arg(short, long, env = "CA_CERT_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    cert: String,
    /// Cluster provider scope
    #[arg(long, conflicts_with_all = ["project", "logical_cloud"])]
    provider: Option<String>,
    #[arg(long, requires = "logical_cloud")]
    project: Option<String>,
    #[arg(long, requires = "project")]
    logical_cloud: Option<String>,
}

impl CertArgs {
    fn key(&self) -> Result<CertKey, Box<dyn std::error::Error>> {
        let scope = match (&self.provider, &self.project, &self.logical_cloud) {
            (Some(provider), _, _) => Scope::provider(provider),
            (None, Some(project), Some(lc)) => Scope::logical_cloud(project, lc),
            _ => return Err("either --provider or --project with --logical-cloud is required".into()),
        };
        Ok(CertKey::new(&self.cert, scope))
    }
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct ApplyArgs {
    #[arg(short, long, env = "CA_CERT_CONFIG")]
    config: Option<PathBuf>,
    /// JSON file holding the intent
    #[arg(short, long)]
    file: PathBuf,
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct LifecycleArgs {
    #[arg(value_enum)]
    action: Action,
    #[command(flatten)]
    target: CertArgs,
    /// Return once the tree is submitted instead of waiting for completion
    #[arg(long)]
    detach: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Action {
    Instantiate,
    Terminate,
    Update,
    Status,
}

impl From<Action> for Operation {
    fn from(action: Action) -> Operation {
        match action {
            Action::Instantiate => Operation::Instantiate,
            Action::Terminate => Operation::Terminate,
            Action::Update => Operation::Update,
            Action::Status => Operation::Status,
        }
    }
}

/// Intent file accepted by `apply`
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentFile {
    scope: Scope,
    cert: Cert,
    #[serde(default)]
    cluster_groups: Vec<ClusterGroup>,
    #[serde(default)]
    logical_clouds: Vec<LogicalCloud>,
}

fn load_config(path: &Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    Ok(config)
}

async fn context(config: &Config) -> Result<OrchestratorContext, Box<dyn std::error::Error>> {
    let store = config.store.open().await?;
    let rsync = Arc::new(RsyncClient::connect_lazy(&config.rsync_endpoint)?);
    let inventory = Arc::new(StaticInventory::new(config.clusters.clone()));
    Ok(OrchestratorContext::new(
        store,
        rsync.clone(),
        rsync,
        inventory,
        config.settings(),
    ))
}

async fn report(outcome: Outcome, detach: bool) -> Result<(), Box<dyn std::error::Error>> {
    match outcome {
        Outcome::Submitted(submission) => {
            info!(tree = %submission.tree_id, "submitted");
            if !detach {
                let tree_id = submission.tree_id.clone();
                submission.wait().await?;
                info!(tree = %tree_id, "complete");
            }
        }
        Outcome::Terminated { tree_id } => info!(tree = %tree_id, "terminated"),
        Outcome::Status(status) => println!("{}", serde_json::to_string_pretty(&status)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match OrchestratorCli::parse() {
        OrchestratorCli::Apply(args) => {
            let ctx = context(&load_config(&args.config)?).await?;
            let raw = std::fs::read_to_string(&args.file)?;
            let intent: IntentFile = serde_json::from_str(&raw)?;
            for lc in intent.logical_clouds.iter() {
                ctx.intents.create_logical_cloud(lc).await?;
            }
            let key = CertKey::new(&intent.cert.name, intent.scope);
            ctx.create_cert(&key, &intent.cert, &intent.cluster_groups)
                .await?;
        }
        OrchestratorCli::Enrollment(args) => {
            let ctx = context(&load_config(&args.target.config)?).await?;
            let stage = EnrollmentStage::new(ctx, args.action.into(), args.target.key()?);
            report(stage.run().await?, args.detach).await?;
        }
        OrchestratorCli::Distribution(args) => {
            let ctx = context(&load_config(&args.target.config)?).await?;
            let stage = DistributionStage::new(ctx, args.action.into(), args.target.key()?);
            report(stage.run().await?, args.detach).await?;
        }
        OrchestratorCli::DeleteCert(args) => {
            let ctx = context(&load_config(&args.config)?).await?;
            ctx.delete_cert(&args.key()?).await?;
        }
    };

    Ok(())
}
