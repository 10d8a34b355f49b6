//! Talos cloud controller manager.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use talos_ccm::cloud::{Cloud, PROVIDER_NAME};
use talos_ccm::config::CloudConfig;
use talos_ccm::metrics;
use talos_ccm::nodeipam::{AllocatorParams, CidrAllocator};
use talos_ccm::platform::apid::ApidTransport;
use talos_ccm::platform::PlatformClient;

/// Controller name enabling the pod CIDR allocator.
const NODE_IPAM_CONTROLLER: &str = "nodeipam";

/// Controller name enabling certificate approval.
const NODE_CSR_APPROVAL_CONTROLLER: &str = "node-csr-approval";

/// Cloud controller manager for Kubernetes clusters running on Talos nodes
#[derive(Parser, Debug)]
#[command(name = "talos-ccm", version, about, long_about = None)]
struct Cli {
    /// The provider of cloud services; must be the talos provider
    #[arg(long, default_value = PROVIDER_NAME)]
    cloud_provider: String,

    /// Path to the cloud configuration file
    #[arg(long, env = "TALOS_CLOUD_CONFIG")]
    cloud_config: Option<String>,

    /// Optional controllers to enable (nodeipam, node-csr-approval)
    #[arg(long, value_delimiter = ',')]
    controllers: Vec<String>,

    /// Allocate and assign pod CIDRs to nodes
    #[arg(long)]
    allocate_node_cidrs: bool,

    /// Comma-separated cluster pod CIDRs; read from the cluster
    /// configuration when unset
    #[arg(long)]
    cluster_cidr: Option<String>,

    /// Comma-separated service CIDRs; read from the cluster configuration
    /// when unset
    #[arg(long)]
    service_cidr: Option<String>,

    /// Node CIDR mask size for single-stack clusters
    #[arg(long)]
    node_cidr_mask_size: Option<u8>,

    /// Node CIDR mask size for the IPv4 cluster CIDR
    #[arg(long)]
    node_cidr_mask_size_ipv4: Option<u8>,

    /// Node CIDR mask size for the IPv6 cluster CIDR
    #[arg(long)]
    node_cidr_mask_size_ipv6: Option<u8>,

    /// Metrics and health listen address
    #[arg(long, default_value = "127.0.0.1:10258")]
    metrics_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install crypto provider");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.cloud_provider != PROVIDER_NAME {
        anyhow::bail!(
            "unsupported cloud provider {:?}, only {PROVIDER_NAME} is available",
            cli.cloud_provider
        );
    }

    for controller in &cli.controllers {
        if controller != NODE_IPAM_CONTROLLER && controller != NODE_CSR_APPROVAL_CONTROLLER {
            anyhow::bail!("unknown controller {controller:?}");
        }
    }

    let mut config = CloudConfig::load(cli.cloud_config.as_deref())?;

    if cli
        .controllers
        .iter()
        .any(|c| c == NODE_CSR_APPROVAL_CONTROLLER)
    {
        config.global.approve_node_csr = true;
    }

    let transport = Arc::new(ApidTransport::connect(&config.global.endpoints).await?);
    let platform = Arc::new(PlatformClient::new(transport));

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let stop = CancellationToken::new();

    {
        let stop = stop.clone();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                stop.cancel();
            }
        });
    }

    let cloud = Cloud::new(client.clone(), config, platform.clone())?;
    cloud.initialize(stop.clone());

    if cli.controllers.iter().any(|c| c == NODE_IPAM_CONTROLLER) && cli.allocate_node_cidrs {
        let cluster_cidrs = match &cli.cluster_cidr {
            Some(cidrs) => split_cidrs(cidrs)?,
            None => parse_cidrs(&platform.pod_cidrs().await?)?,
        };
        let service_cidrs = match &cli.service_cidr {
            Some(cidrs) => split_cidrs(cidrs)?,
            None => parse_cidrs(&platform.service_cidrs().await?)?,
        };

        let params = AllocatorParams::build(
            cluster_cidrs,
            service_cidrs,
            cli.node_cidr_mask_size,
            cli.node_cidr_mask_size_ipv4,
            cli.node_cidr_mask_size_ipv6,
        )?;

        let allocator = CidrAllocator::new(client.clone(), platform.clone(), params)?;
        let shutdown = cloud.shutdown_token();
        let stop_on_failure = stop.clone();

        tokio::spawn(async move {
            if let Err(e) = allocator.run(shutdown).await {
                tracing::error!(error = %e, "CIDR allocator failed");
                stop_on_failure.cancel();
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(cli.metrics_addr).await?;
    tracing::info!(addr = %cli.metrics_addr, "metrics listener started");

    let metrics_server = std::future::IntoFuture::into_future(axum::serve(listener, metrics::router()));

    tokio::select! {
        result = metrics_server => {
            result.map_err(|e| anyhow::anyhow!("metrics server error: {e}"))?;
        }
        _ = stop.cancelled() => {}
    }

    tracing::info!("talos cloud controller manager shutting down");

    Ok(())
}

fn split_cidrs(raw: &str) -> anyhow::Result<Vec<ipnet::IpNet>> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid CIDR {part:?}: {e}"))
        })
        .collect()
}

fn parse_cidrs(raw: &[String]) -> anyhow::Result<Vec<ipnet::IpNet>> {
    raw.iter()
        .map(|part| {
            part.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid CIDR {part:?}: {e}"))
        })
        .collect()
}
