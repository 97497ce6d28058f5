#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod};
use rekon_core::{ChangeEvent, ObjectKey, Selector};
use rekon_kubehub::KubeRemote;
use rekon_runtime::{Controller, ControllerConfig, ControllerError, GiveUpPolicy, ReconcileError, Reconciler, Reflector};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rekonctl", version, about = "Rekon reconciliation engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch (default: all namespaces)
    #[arg(short = 'n', long = "ns", global = true)]
    namespace: Option<String>,

    /// Log filter directives, e.g. `info,rekon_runtime=debug`
    #[arg(long = "log", env = "REKON_LOG", global = true, default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address
    #[arg(long = "metrics-addr", env = "REKON_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile Pods, logging every sync and every disappearance
    Controller(ControllerArgs),
    /// Mirror Deployments, log their changes and list them once synced
    Informer {
        #[arg(long = "resync-secs", default_value_t = 30)]
        resync_secs: u64,
        /// Namespace listed after sync (default: --ns, else "default")
        #[arg(long = "list-ns")]
        list_ns: Option<String>,
    },
}

/// Flags overriding `REKON_*` settings for the pod controller.
#[derive(Args, Debug)]
struct ControllerArgs {
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long = "max-retries")]
    max_retries: Option<u32>,
    /// Re-enqueue every cached pod this often (0 disables)
    #[arg(long = "resync-secs")]
    resync_secs: Option<u64>,
    /// report | report-and-notify
    #[arg(long = "give-up")]
    give_up: Option<GiveUpPolicy>,
}

impl ControllerArgs {
    fn apply(&self, mut cfg: ControllerConfig) -> ControllerConfig {
        if let Some(v) = self.workers { cfg.workers = v; }
        if let Some(v) = self.max_retries { cfg.max_retries = v; }
        if let Some(v) = self.resync_secs { cfg.resync_secs = v; }
        if let Some(v) = self.give_up { cfg.give_up = v; }
        cfg
    }
}

/// Logs go to stderr so `-o json` output on stdout stays machine-readable.
fn init_tracing(directives: &str) {
    let (filter, rejected) = match EnvFilter::try_new(directives) {
        Ok(f) => (f, None),
        Err(e) => (EnvFilter::new("info"), Some(e)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(true).init();
    if let Some(e) = rejected {
        warn!(directives, error = %e, "bad log filter, falling back to info");
    }
}

fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else { return Ok(()) };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("serving metrics on {addr}"))?;
    info!(%addr, "metrics exporter listening");
    Ok(())
}

/// Token cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                trigger.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
    token
}

fn selector(namespace: Option<&str>) -> Selector { namespace.map(Selector::namespaced).unwrap_or_default() }

struct PodLogger;

#[async_trait::async_trait]
impl Reconciler<Pod> for PodLogger {
    async fn reconcile(&self, key: &ObjectKey, pod: Option<Arc<Pod>>) -> Result<(), ReconcileError> {
        match pod {
            Some(pod) => {
                let name = pod.metadata.name.as_deref().unwrap_or(&key.name);
                info!(key = %key, "sync/add/update for pod {name}");
            }
            None => info!("pod {key} does not exist anymore"),
        }
        Ok(())
    }
}

async fn run_controller(namespace: Option<&str>, args: &ControllerArgs, cancel: CancellationToken) -> Result<()> {
    let cfg = args.apply(ControllerConfig::from_env("pods"));

    let client = rekon_kubehub::connect().await?;
    let remote = Arc::new(KubeRemote::<Pod>::namespaced(client));
    let controller = Controller::new(cfg, remote, PodLogger).selector(selector(namespace));
    match controller.run(cancel).await {
        Ok(()) => Ok(()),
        Err(ControllerError::SyncAborted(name)) => {
            warn!(controller = %name, "stopped before the pod cache synced");
            Ok(())
        }
    }
}

fn deploy_name(d: &Deployment) -> &str { d.metadata.name.as_deref().unwrap_or("<unnamed>") }

async fn log_deployment_events(mut events: mpsc::Receiver<ChangeEvent<Deployment>>) {
    while let Some(ev) = events.recv().await {
        match &ev {
            ChangeEvent::Added(d) => info!("add a deployment: {}", deploy_name(d)),
            ChangeEvent::Updated { old, new } => info!("update deployment: {} {}", deploy_name(old), deploy_name(new)),
            ChangeEvent::Deleted(d) => info!("delete a deployment: {}", deploy_name(d)),
        }
    }
}

async fn run_informer(
    namespace: Option<&str>,
    list_ns: &str,
    resync_secs: u64,
    output: Output,
    cancel: CancellationToken,
) -> Result<()> {
    let cfg = ControllerConfig::from_env("deployments");
    let client = rekon_kubehub::connect().await?;
    let remote = Arc::new(KubeRemote::<Deployment>::namespaced(client));
    let (writer, reader) = rekon_store::store::<Deployment>();
    let (tx, rx) = mpsc::channel(cfg.event_buffer.max(1));

    let reflector = Reflector::new(cfg.name.clone(), remote, selector(namespace), writer, tx)
        .backoff(cfg.watch_backoff())
        .resync_every(Some(Duration::from_secs(resync_secs)));
    let reflector_task = tokio::spawn(reflector.run(cancel.clone()));
    let events_task = tokio::spawn(log_deployment_events(rx));

    let synced = tokio::select! {
        _ = reader.wait_synced() => true,
        _ = cancel.cancelled() => false,
    };
    if synced {
        let mut deployments = reader.list_namespace(list_ns);
        deployments.sort_by(|a, b| deploy_name(a).cmp(deploy_name(b)));
        match output {
            Output::Human => {
                for (idx, d) in deployments.iter().enumerate() {
                    println!("{} -> {}", idx + 1, deploy_name(d));
                }
            }
            Output::Json => {
                let names: Vec<_> = deployments.iter().map(|d| deploy_name(d)).collect();
                println!("{}", serde_json::to_string_pretty(&names)?);
            }
        }
        cancel.cancelled().await;
    } else {
        warn!("stopped before the deployment cache synced");
    }

    reflector_task.await?;
    events_task.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    init_metrics(cli.metrics_addr)?;
    let cancel = shutdown_token();
    let ns = cli.namespace.as_deref();

    let res = match cli.command {
        Commands::Controller(args) => {
            info!(ns = ?ns, ?args, "controller invoked");
            run_controller(ns, &args, cancel).await
        }
        Commands::Informer { resync_secs, list_ns } => {
            let list_ns = list_ns.as_deref().or(ns).unwrap_or("default").to_string();
            info!(ns = ?ns, list_ns = %list_ns, "informer invoked");
            run_informer(ns, &list_ns, resync_secs, cli.output, cancel).await
        }
    };
    if let Err(e) = &res {
        error!(error = ?e, "rekonctl failed");
    }
    res
}
