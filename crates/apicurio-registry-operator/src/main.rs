//! Apicurio Registry Kubernetes Operator
//!
//! This operator manages ApicurioRegistry3 custom resources in Kubernetes,
//! deploying the registry backend, its web console and their networking.

use anyhow::{Context, Result};
use apicurio_registry_operator::builder::{BuilderDefaults, DEFAULT_REGISTRY_VERSION};
use apicurio_registry_operator::config::{
    OperatorConfig, DEFAULT_BACKOFF_BASE_MILLIS, DEFAULT_BACKOFF_MAX_SECONDS,
    DEFAULT_PERMANENT_REQUEUE_SECONDS, DEFAULT_PROGRESS_POLL_SECONDS, DEFAULT_WORKERS,
};
use apicurio_registry_operator::crd::ApicurioRegistry3;
use apicurio_registry_operator::operator::Operator;
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Apicurio Registry Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "apicurio-registry-operator")]
#[command(about = "Kubernetes operator for Apicurio Registry 3")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// First retry delay after a transient error, in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = DEFAULT_BACKOFF_BASE_MILLIS)]
    backoff_base_ms: u64,

    /// Retry delay cap for transient errors, in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = DEFAULT_BACKOFF_MAX_SECONDS)]
    backoff_max_secs: u64,

    /// Requeue interval after a permanent error, in seconds
    #[arg(long, env = "PERMANENT_REQUEUE_SECS", default_value_t = DEFAULT_PERMANENT_REQUEUE_SECONDS)]
    permanent_requeue_secs: u64,

    /// Requeue interval while a registry is rolling out, in seconds
    #[arg(long, env = "PROGRESS_POLL_SECS", default_value_t = DEFAULT_PROGRESS_POLL_SECONDS)]
    progress_poll_secs: u64,

    /// Registry version used for default images
    #[arg(long, env = "REGISTRY_VERSION", default_value = DEFAULT_REGISTRY_VERSION)]
    registry_version: String,

    /// Default backend image (overrides the version-based default)
    #[arg(long, env = "REGISTRY_APP_IMAGE")]
    app_image: Option<String>,

    /// Default UI image (overrides the version-based default)
    #[arg(long, env = "REGISTRY_UI_IMAGE")]
    ui_image: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        let mut defaults = BuilderDefaults::for_version(&self.registry_version);
        if let Some(image) = &self.app_image {
            defaults.app_image = image.clone();
        }
        if let Some(image) = &self.ui_image {
            defaults.ui_image = image.clone();
        }

        OperatorConfig {
            // empty string means cluster-wide
            namespace: Some(self.namespace.clone()).filter(|ns| !ns.is_empty()),
            workers: self.workers,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            permanent_requeue: Duration::from_secs(self.permanent_requeue_secs),
            progress_poll: Duration::from_secs(self.progress_poll_secs),
            defaults,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        registry_version = %args.registry_version,
        namespace = config.namespace.as_deref().unwrap_or("all"),
        "Starting Apicurio Registry Kubernetes Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    Operator::new(client, config)
        .run()
        .await
        .context("Operator failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = ApicurioRegistry3::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_to_config() {
        let args = Args::parse_from([
            "apicurio-registry-operator",
            "--namespace",
            "registries",
            "--workers",
            "8",
            "--registry-version",
            "3.1.0",
            "--ui-image",
            "example.com/ui:dev",
        ]);
        let config = args.operator_config();
        assert_eq!(config.namespace.as_deref(), Some("registries"));
        assert_eq!(config.workers, 8);
        assert_eq!(
            config.defaults.app_image,
            "quay.io/apicurio/apicurio-registry:3.1.0"
        );
        assert_eq!(config.defaults.ui_image, "example.com/ui:dev");
    }

    #[test]
    fn test_empty_namespace_is_cluster_wide() {
        let args = Args::parse_from(["apicurio-registry-operator"]);
        let config = args.operator_config();
        assert_eq!(config.namespace, None);
        assert_eq!(config.progress_poll, Duration::from_secs(DEFAULT_PROGRESS_POLL_SECONDS));
    }
}
