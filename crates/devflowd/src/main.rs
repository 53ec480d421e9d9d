//! devflowd - the devflow reconciler daemon and release CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;

use devflow_runtime::engine::{
    GitOpsApplication, KubeRestClient, KubeRestConfig, PipelineRun, TaskRun,
};
use devflow_runtime::logging::init_logging;
use devflow_runtime::reconcile::WatchLoop;
use devflow_runtime::release::{CreateJobRequest, CreateManifestRequest};
use devflow_runtime::store::{ApplicationId, ManifestId, MongoDocumentStore};
use devflow_runtime::{
    DevflowConfig, DocumentStore, GitOpsReconciler, PipelineReconciler, ReleaseService,
    ReleaseSettings, TraceContext,
};

#[derive(Debug, Parser)]
#[command(name = "devflowd", version, about = "devflow delivery control plane")]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, short = 'c', env = "DEVFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch pipeline and GitOps resources and reconcile devflow records.
    Run(RunArgs),
    /// Start a build for an application.
    CreateManifest(CreateManifestArgs),
    /// Deploy a manifest.
    CreateJob(CreateJobArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Seconds to wait before reopening a watch that ended.
    #[arg(long, default_value = "5")]
    reconnect_delay_secs: u64,
}

#[derive(Debug, Args)]
struct CreateManifestArgs {
    #[arg(long)]
    application_id: String,

    /// Source branch; `main` when omitted.
    #[arg(long)]
    branch: Option<String>,

    /// W3C `traceparent` to continue; a new trace is started otherwise.
    #[arg(long)]
    traceparent: Option<String>,
}

#[derive(Debug, Args)]
struct CreateJobArgs {
    #[arg(long)]
    manifest_id: String,

    /// `install`, `upgrade` or `rollback`.
    #[arg(long = "type")]
    job_type: Option<String>,

    #[arg(long)]
    traceparent: Option<String>,
}

fn read_token(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(token) => Ok(Some(token.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                path = %path.display(),
                "token file not found; calling the api server anonymously"
            );
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("reading token file {}", path.display())),
    }
}

fn kube_client(config: &DevflowConfig) -> Result<KubeRestClient> {
    let mut rest = KubeRestConfig::new(config.kube.api_server.clone());
    rest.insecure_skip_tls_verify = config.kube.insecure_skip_tls_verify;
    rest.request_timeout = Duration::from_secs(config.kube.request_timeout_secs);
    if let Some(path) = &config.kube.token_file {
        rest.bearer_token = read_token(path)?;
    }
    KubeRestClient::new(rest).context("building kubernetes client")
}

async fn document_store(config: &DevflowConfig) -> Result<Arc<dyn DocumentStore>> {
    let store = MongoDocumentStore::connect(&config.mongo.uri, &config.mongo.db)
        .await
        .with_context(|| format!("connecting to mongodb database {}", config.mongo.db))?;
    Ok(Arc::new(store))
}

fn trace_context(traceparent: Option<&str>) -> TraceContext {
    traceparent
        .and_then(TraceContext::from_traceparent)
        .map(|parent| parent.child())
        .unwrap_or_else(TraceContext::generate)
}

async fn release_service(config: &DevflowConfig) -> Result<ReleaseService> {
    let store = document_store(config).await?;
    let kube = Arc::new(kube_client(config)?);
    Ok(ReleaseService::new(
        store,
        kube.clone(),
        kube.clone(),
        kube,
        ReleaseSettings::from(config),
    ))
}

async fn run(config: &DevflowConfig, args: RunArgs) -> Result<()> {
    let store = document_store(config).await?;
    let kube = kube_client(config)?;
    let delay = Duration::from_secs(args.reconnect_delay_secs);
    let pipelines = Arc::new(PipelineReconciler::new(store.clone()));
    let gitops = Arc::new(GitOpsReconciler::new(store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline_ns = &config.pipeline.namespace;
    let handles = vec![
        WatchLoop::<PipelineRun>::new(
            "pipelineruns",
            Arc::new(kube.watcher::<PipelineRun>(
                "PipelineRun",
                KubeRestClient::pipeline_runs_path(pipeline_ns),
            )),
            pipelines.clone(),
        )
        .with_reconnect_delay(delay)
        .spawn(shutdown_rx.clone()),
        WatchLoop::<TaskRun>::new(
            "taskruns",
            Arc::new(kube.watcher::<TaskRun>(
                "TaskRun",
                KubeRestClient::task_runs_path(pipeline_ns),
            )),
            pipelines,
        )
        .with_reconnect_delay(delay)
        .spawn(shutdown_rx.clone()),
        WatchLoop::<GitOpsApplication>::new(
            "applications",
            Arc::new(kube.watcher::<GitOpsApplication>(
                "Application",
                KubeRestClient::applications_path(&config.gitops.namespace),
            )),
            gitops,
        )
        .with_reconnect_delay(delay)
        .spawn(shutdown_rx),
    ];
    tracing::info!(
        pipeline_namespace = %pipeline_ns,
        gitops_namespace = %config.gitops.namespace,
        "devflowd reconciling"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        match handle.await {
            Ok(stats) => tracing::info!(
                events = stats.events,
                applied = stats.applied,
                skipped = stats.skipped,
                errors = stats.errors,
                reconnects = stats.reconnects,
                "watch loop finished"
            ),
            Err(e) => tracing::error!(error = %e, "watch loop panicked"),
        }
    }
    Ok(())
}

async fn create_manifest(config: &DevflowConfig, args: CreateManifestArgs) -> Result<()> {
    let application_id: ApplicationId = args
        .application_id
        .parse()
        .context("invalid --application-id")?;
    let trace = trace_context(args.traceparent.as_deref());
    let service = release_service(config).await?;
    let manifest = service
        .create_manifest(
            CreateManifestRequest {
                application_id,
                branch: args.branch,
            },
            &trace,
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

async fn create_job(config: &DevflowConfig, args: CreateJobArgs) -> Result<()> {
    let manifest_id: ManifestId = args.manifest_id.parse().context("invalid --manifest-id")?;
    let trace = trace_context(args.traceparent.as_deref());
    let service = release_service(config).await?;
    let job = service
        .create_job(
            CreateJobRequest {
                manifest_id,
                job_type: args.job_type,
            },
            &trace,
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DevflowConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.log);

    match cli.command {
        Commands::Run(args) => run(&config, args).await,
        Commands::CreateManifest(args) => create_manifest(&config, args).await,
        Commands::CreateJob(args) => create_job(&config, args).await,
    }
}
