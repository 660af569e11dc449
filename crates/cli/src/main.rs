//! Konverge CLI: plan, apply and destroy declarative resource sets against a
//! managed system.

#![forbid(unsafe_code)]

mod loader;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use konverge_client::{KubeClient, ResourceClient};
use konverge_core::RunStatus;
use konverge_diff::{diff, DiffPolicy};
use konverge_engine::{cancel_channel, CancelToken, ReconcileConfig, ReconcileMode};
use konverge_graph::ResourceGraph;
use konverge_persist::{SqliteStore, Store};

#[derive(Parser, Debug)]
#[command(name = "konverge", version, about = "Desired-state reconciler for declarative resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace applied to resources that declare none
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Reconciliation target identity (keys the persisted snapshot)
    #[arg(long = "target", global = true, default_value = "default")]
    target: String,

    /// Variable overrides, NAME=VALUE (repeatable)
    #[arg(long = "var", global = true, value_name = "NAME=VALUE")]
    vars: Vec<String>,

    /// Upper bound on concurrently running actions
    #[arg(long = "concurrency", global = true, default_value_t = 4)]
    concurrency: usize,

    /// Maximum diff/apply passes before a diverged target fails
    #[arg(long = "max-attempts", global = true, default_value_t = 5)]
    max_attempts: u32,

    /// Base backoff between retrying passes, in milliseconds
    #[arg(long = "backoff-ms", global = true, default_value_t = 500)]
    backoff_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Diff declarations against observed state and print the change-set
    Plan {
        /// Declarations file (multi-document YAML)
        file: PathBuf,
        /// Diff against the persisted snapshot instead of the live system
        #[arg(long = "offline", action = ArgAction::SetTrue)]
        offline: bool,
    },
    /// Reconcile until convergence or terminal failure
    Apply {
        /// Declarations file (multi-document YAML)
        file: PathBuf,
    },
    /// Delete every declared resource, dependents first
    Destroy {
        /// Declarations file (multi-document YAML)
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("KONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

fn build_graph(cli: &Cli, file: &PathBuf) -> Result<ResourceGraph> {
    let opts = loader::LoadOptions {
        default_namespace: cli.namespace.clone(),
        overrides: cli.vars.clone(),
    };
    let resources = loader::load_file(file, &opts)?;
    ResourceGraph::build(resources).context("building resource graph")
}

fn reconcile_config(cli: &Cli) -> ReconcileConfig {
    ReconcileConfig {
        target: cli.target.clone(),
        max_attempts: cli.max_attempts,
        backoff: Duration::from_millis(cli.backoff_ms),
        concurrency: cli.concurrency,
    }
}

/// Ctrl-C stops new actions; in-flight ones are allowed to finish.
fn wire_ctrl_c() -> CancelToken {
    let (handle, token) = cancel_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling after in-flight actions finish");
            handle.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let policy = DiffPolicy::kubernetes_defaults();

    match &cli.command {
        Commands::Plan { file, offline } => {
            let graph = build_graph(&cli, file)?;
            let store = SqliteStore::open_default()?;
            let changeset = if *offline {
                let observed = store
                    .get_snapshot(&cli.target)?
                    .unwrap_or_default();
                diff(&graph, &observed, &policy)
            } else {
                let client = Arc::new(KubeClient::try_default().await?);
                let (_observed, cs) = konverge_engine::plan(
                    &graph,
                    &policy,
                    client as Arc<dyn ResourceClient>,
                    Some(&store),
                    &cli.target,
                )
                .await?;
                cs
            };
            render::changeset(&changeset, cli.output == Output::Json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Apply { file } => {
            let graph = build_graph(&cli, file)?;
            let store = SqliteStore::open_default()?;
            let client = Arc::new(KubeClient::try_default().await?);
            let run = konverge_engine::reconcile(
                &graph,
                &policy,
                client as Arc<dyn ResourceClient>,
                Some(&store),
                &reconcile_config(&cli),
                wire_ctrl_c(),
                ReconcileMode::Apply,
            )
            .await?;
            render::run(&run, cli.output == Output::Json)?;
            Ok(exit_for(run.status))
        }
        Commands::Destroy { file } => {
            let graph = build_graph(&cli, file)?;
            let store = SqliteStore::open_default()?;
            let client = Arc::new(KubeClient::try_default().await?);
            let run = konverge_engine::reconcile(
                &graph,
                &policy,
                client as Arc<dyn ResourceClient>,
                Some(&store),
                &reconcile_config(&cli),
                wire_ctrl_c(),
                ReconcileMode::Destroy,
            )
            .await?;
            render::run(&run, cli.output == Output::Json)?;
            Ok(exit_for(run.status))
        }
    }
}

fn exit_for(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Converged => ExitCode::SUCCESS,
        RunStatus::Failed => ExitCode::FAILURE,
    }
}
