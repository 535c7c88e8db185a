#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use steward_controller::app::{self, App};
use steward_controller::ingress::{self, AnnotationMatch, IngressPolicy, IngressTemplate};
use steward_controller::{Controller, ControllerConfig, Primary, DEFAULT_INGEST_CAPACITY, DEFAULT_MAX_RETRIES, DEFAULT_WORKERS};
use steward_kubehub::{KubeApi, KubeEventSink};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "steward", version, about = "Level-triggered reconciliation controllers")]
struct Cli {
    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns", global = true, env = "STEWARD_NAMESPACE")]
    namespace: Option<String>,

    /// Concurrent reconcile workers
    #[arg(long, global = true, env = "STEWARD_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Failed passes retried per object before giving up
    #[arg(long = "max-retries", global = true, env = "STEWARD_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Re-enqueue every primary this often; 0 disables
    #[arg(long = "resync-secs", global = true, env = "STEWARD_RESYNC_SECS", default_value_t = 0)]
    resync_secs: u64,

    /// Buffer between each watcher and its cache
    #[arg(long = "queue-cap", global = true, env = "STEWARD_QUEUE_CAP", default_value_t = DEFAULT_INGEST_CAPACITY)]
    queue_cap: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum MatchMode { Presence, Exact }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Give every annotated Service an Ingress
    Ingress {
        #[arg(long, default_value = ingress::DEFAULT_ANNOTATION)]
        annotation: String,
        /// How the annotation value is judged
        #[arg(long = "match", value_enum, default_value_t = MatchMode::Presence)]
        matcher: MatchMode,
        /// Required value for `--match exact`
        #[arg(long)]
        value: Option<String>,
        #[arg(long, default_value = ingress::DEFAULT_HOST)]
        host: String,
        #[arg(long, default_value = ingress::DEFAULT_CLASS)]
        class: String,
        #[arg(long, default_value_t = ingress::DEFAULT_PORT)]
        port: i32,
    },
    /// Reconcile App resources into a Deployment and a Service
    App,
    /// Print the App CustomResourceDefinition as YAML
    Crd,
}

impl Cli {
    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.max(1),
            max_retries: self.max_retries,
            namespace: self.namespace.clone(),
            resync: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            ingest_capacity: self.queue_cap.max(1),
            ..Default::default()
        }
    }
}

fn ingress_template(
    annotation: String,
    matcher: MatchMode,
    value: Option<String>,
    host: String,
    class: String,
    port: i32,
) -> Result<IngressTemplate> {
    let matcher = match (matcher, value) {
        (MatchMode::Presence, _) => AnnotationMatch::Presence,
        (MatchMode::Exact, Some(v)) => AnnotationMatch::Exact(v),
        (MatchMode::Exact, None) => bail!("--match exact requires --value"),
    };
    Ok(IngressTemplate { policy: IngressPolicy { annotation, matcher }, host, class, port, ..Default::default() })
}

fn init_tracing() {
    let env = std::env::var("STEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEWARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STEWARD_METRICS_ADDR; expected host:port");
        }
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// First signal drains gracefully; a second one exits at once.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!(error = %e, "cannot listen for shutdown signals");
            return;
        }
        info!("shutdown signal received; finishing in-flight work (signal again to force exit)");
        shutdown.cancel();
        if wait_for_signal().await.is_ok() {
            warn!("second signal received; exiting immediately");
            std::process::exit(1);
        }
    });
}

/// Abandoned keys are already logged by the retry policy; keep the channel drained.
async fn run_controller<P: Primary>(controller: Controller<P>) -> Result<()> {
    if let Some(mut failures) = controller.failures() {
        tokio::spawn(async move {
            while let Some(report) = failures.recv().await {
                warn!(key = %report.key, attempts = report.attempts, "object left unreconciled until it changes again");
            }
        });
    }
    controller.run().await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = cli.config();

    match cli.command {
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&App::crd()).context("rendering App CRD")?);
            Ok(())
        }
        Commands::Ingress { annotation, matcher, value, host, class, port } => {
            let template = ingress_template(annotation, matcher, value, host, class, port)?;
            let client = steward_kubehub::client().await?;
            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());
            let ns = config.namespace.clone();
            info!(namespace = ?ns, annotation = %template.policy.annotation, "starting service-ingress controller");
            let controller = ingress::controller(
                config,
                template,
                KubeApi::shared(client.clone(), ns.clone()),
                KubeApi::shared(client.clone(), ns),
                Arc::new(KubeEventSink::new(client, ingress::CONTROLLER_NAME)),
                shutdown,
            );
            run_controller(controller).await
        }
        Commands::App => {
            let client = steward_kubehub::client().await?;
            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());
            let ns = config.namespace.clone();
            info!(namespace = ?ns, "starting app controller");
            let controller = app::controller(
                config,
                KubeApi::shared(client.clone(), ns.clone()),
                KubeApi::shared(client.clone(), ns.clone()),
                KubeApi::shared(client.clone(), ns),
                Arc::new(KubeEventSink::new(client, app::CONTROLLER_NAME)),
                shutdown,
            );
            run_controller(controller).await
        }
    }
}
