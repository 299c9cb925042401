//! OCI CSI Plugin
//!
//! Supervisor binary for the node-side services. It wires the per-family
//! node service (block, shared filesystem or Lustre) to the Kubernetes node
//! inventory and the host command runner, then serves health and metrics
//! endpoints until the process is asked to stop. The gRPC transport attaches
//! to the constructed [`NodeService`] from outside this crate; the
//! controller services live in `oci_csi::controller` and are bound by the
//! process that owns the cloud clients.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use oci_csi::csi::NodeService;
use oci_csi::k8s::KubeNodeInventory;
use oci_csi::node::{BlockVolumeNode, FssVolumeNode, LustreVolumeNode};
use oci_csi::util::HostCommandRunner;
use oci_csi::{Config, Error};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VolumeFamily {
    Block,
    Fss,
    Lustre,
}

/// OCI CSI Plugin - node services for block, shared-FS and Lustre volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Volume family this instance serves
    #[arg(long, value_enum, env = "VOLUME_FAMILY", default_value = "block")]
    family: VolumeFamily,

    /// Kubernetes node name this plugin runs on
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    /// Primary IP address of this node (Lustre LNet default subnet)
    #[arg(long, env = "NODE_IP", default_value = "")]
    node_ip: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!(version = oci_csi::VERSION, family = ?args.family, node_id = %args.node_id,
        "starting OCI CSI plugin");

    // Fail fast on a broken config file; absence is fine on pure node hosts.
    let config_path = Config::path();
    if config_path.exists() {
        let config = Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        info!(compartment = %config.compartment, "configuration loaded");
    }

    let kube_client = kube::Client::try_default()
        .await
        .context("building kubernetes client")?;
    let inventory = Arc::new(KubeNodeInventory::new(kube_client));
    let runner = Arc::new(HostCommandRunner);

    let service: Arc<dyn NodeService> = match args.family {
        VolumeFamily::Block => Arc::new(BlockVolumeNode::new(
            args.node_id.clone(),
            inventory,
            runner,
        )),
        VolumeFamily::Fss => Arc::new(FssVolumeNode::new(
            args.node_id.clone(),
            inventory,
            runner,
        )),
        VolumeFamily::Lustre => Arc::new(LustreVolumeNode::new(
            args.node_id.clone(),
            args.node_ip.clone(),
            inventory,
            runner,
        )),
    };
    info!(capabilities = ?service.capabilities(), "node service ready");

    let shutdown = CancellationToken::new();

    let health_addr = args.health_addr.clone();
    let health_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = run_health_server(&health_addr).await {
            error!(%err, "health server error");
            health_shutdown.cancel();
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = oci_csi::metrics::run_metrics_server(&metrics_addr).await {
            error!(%err, "metrics server error");
            metrics_shutdown.cancel();
        }
    });

    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("listening for shutdown signal")?;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    }

    info!("plugin shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> oci_csi::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let status = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => StatusCode::OK,
                _ => StatusCode::NOT_FOUND,
            };
            let body = if status == StatusCode::OK { "ok" } else { "not found" };
            Ok::<_, std::convert::Infallible>(
                Response::builder()
                    .status(status)
                    .body(Body::from(body))
                    .unwrap_or_default(),
            )
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid health server address: {}", e)))?;

    info!("health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("health server error: {}", e)))?;

    Ok(())
}
