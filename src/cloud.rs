//! Provider constants and the controller entry point.
//!
//! The capability surface is deliberately narrow: instance metadata is the
//! only implemented concern, and the unimplemented ones (load balancers,
//! routes, zones, clusters) are explicit `false` markers rather than
//! optional objects. `initialize` is the single entry point: it derives a
//! root cancellation token for all controller tasks and starts them.

use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::CloudConfig;
use crate::csr::CsrController;
use crate::instances::Instances;
use crate::platform::PlatformClient;
use crate::Result;

/// Name of this cloud provider.
pub const PROVIDER_NAME: &str = "talos";

/// Service account the controller runs as.
pub const SERVICE_ACCOUNT_NAME: &str = "talos-cloud-controller-manager";

/// Node label carrying the cluster name.
pub const CLUSTER_NAME_NODE_LABEL: &str = "node.cloudprovider.kubernetes.io/clustername";

/// Node label carrying the platform name.
pub const CLUSTER_NODE_PLATFORM_LABEL: &str = "node.cloudprovider.kubernetes.io/platform";

/// Node label carrying the lifecycle type of the compute node.
pub const CLUSTER_NODE_LIFECYCLE_LABEL: &str = "node.cloudprovider.kubernetes.io/lifecycle";

/// The cloud provider: configuration, machine API access and the instance
/// surface.
pub struct Cloud {
    config: Arc<CloudConfig>,
    instances: Arc<Instances>,
    client: Client,
    shutdown: CancellationToken,
}

impl Cloud {
    /// Assemble the provider from its collaborators.
    pub fn new(
        client: Client,
        config: CloudConfig,
        platform: Arc<PlatformClient>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let instances = Arc::new(Instances::new(client.clone(), config.clone(), platform));

        Ok(Self {
            config,
            instances,
            client,
            shutdown: CancellationToken::new(),
        })
    }

    /// The instance metadata surface.
    pub fn instances(&self) -> Arc<Instances> {
        Arc::clone(&self.instances)
    }

    /// Provider name reported to the cluster.
    pub fn provider_name(&self) -> &'static str {
        PROVIDER_NAME
    }

    /// This provider always knows its cluster.
    pub fn has_cluster_id(&self) -> bool {
        true
    }

    /// Load balancers are not implemented.
    pub fn supports_load_balancer(&self) -> bool {
        false
    }

    /// Routes are not implemented.
    pub fn supports_routes(&self) -> bool {
        false
    }

    /// Zones discovery beyond instance metadata is not implemented.
    pub fn supports_zones(&self) -> bool {
        false
    }

    /// Cluster enumeration is not implemented.
    pub fn supports_clusters(&self) -> bool {
        false
    }

    /// Start the long-running controller tasks, fanning the upstream stop
    /// signal out through a derived cancellation token.
    ///
    /// Spawns the node initialization loop and, when enabled in the
    /// configuration, the certificate approval controller. The pod CIDR
    /// allocator has its own sizing inputs and is wired up separately by
    /// `main`.
    pub fn initialize(&self, stop: CancellationToken) {
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            stop.cancelled().await;
            info!("received cloud provider termination signal");
            shutdown.cancel();
        });

        tokio::spawn(Arc::clone(&self.instances).run(self.shutdown.clone()));

        if self.config.global.approve_node_csr {
            info!("started certificate signing request controller");
            tokio::spawn(CsrController::new(self.client.clone()).run(self.shutdown.clone()));
        }

        info!("talos cloud provider initialized");
    }

    /// Token cancelled when the provider shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
