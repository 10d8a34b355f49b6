//! Machine API access.
//!
//! The wire protocol lives behind the [`MachineTransport`] trait; the
//! controller code only ever talks to [`PlatformClient`], which layers the
//! retry and reconnect policy on top: every call is retried on a constant
//! 100 ms cadence for up to 10 s, and before each retry the transport is
//! probed with a version call and re-established if the probe fails.

pub mod apid;
pub mod azure;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics;
use crate::{Error, Result};

pub use self::types::{AddressFlags, InterfaceAddress, PlatformMetadata, SystemInformation};

/// Constant pause between retries of a machine API call.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Total retry budget for a machine API call.
const RETRY_BUDGET: Duration = Duration::from_secs(10);

/// Transport-level access to the machine API.
///
/// One implementation speaks the real wire protocol
/// ([`apid::ApidTransport`]); tests substitute a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MachineTransport: Send + Sync {
    /// API version of the configured endpoints; doubles as the liveness
    /// probe.
    async fn version(&self) -> Result<String>;

    /// OS version of one node.
    async fn node_version(&self, node_ip: &str) -> Result<String>;

    /// Platform metadata of one node.
    async fn node_metadata(&self, node_ip: &str) -> Result<PlatformMetadata>;

    /// Address list of one node.
    async fn node_interfaces(&self, node_ip: &str) -> Result<Vec<InterfaceAddress>>;

    /// SMBIOS system information of one node.
    async fn node_system_info(&self, node_ip: &str) -> Result<SystemInformation>;

    /// Cluster-wide pod CIDRs from the controller manager configuration.
    async fn pod_cidrs(&self) -> Result<Vec<String>>;

    /// Cluster-wide service CIDRs from the controller manager configuration.
    async fn service_cidrs(&self) -> Result<Vec<String>>;

    /// Cluster name recorded in the credentials, if any.
    fn cluster_name(&self) -> Option<String>;

    /// Tear down and re-establish the transport.
    async fn reconnect(&self) -> Result<()>;
}

/// Machine API client with the retry and reconnect policy applied.
pub struct PlatformClient {
    transport: Arc<dyn MachineTransport>,
}

impl PlatformClient {
    /// Wrap a transport.
    pub fn new(transport: Arc<dyn MachineTransport>) -> Self {
        Self { transport }
    }

    /// Cluster name recorded in the credentials, if any.
    pub fn cluster_name(&self) -> Option<String> {
        self.transport.cluster_name()
    }

    /// Platform metadata of one node.
    pub async fn node_metadata(&self, node_ip: &str) -> Result<PlatformMetadata> {
        self.retry("metadata", || self.transport.node_metadata(node_ip))
            .await
    }

    /// Address list of one node.
    pub async fn node_interfaces(&self, node_ip: &str) -> Result<Vec<InterfaceAddress>> {
        self.retry("interfaces", || self.transport.node_interfaces(node_ip))
            .await
    }

    /// SMBIOS system information of one node.
    pub async fn node_system_info(&self, node_ip: &str) -> Result<SystemInformation> {
        self.retry("systeminfo", || self.transport.node_system_info(node_ip))
            .await
    }

    /// OS version of one node.
    pub async fn node_version(&self, node_ip: &str) -> Result<String> {
        self.retry("version", || self.transport.node_version(node_ip))
            .await
    }

    /// Cluster-wide pod CIDRs.
    pub async fn pod_cidrs(&self) -> Result<Vec<String>> {
        self.retry("podcidrs", || self.transport.pod_cidrs()).await
    }

    /// Cluster-wide service CIDRs.
    pub async fn service_cidrs(&self) -> Result<Vec<String>> {
        self.retry("servicecidrs", || self.transport.service_cidrs())
            .await
    }

    async fn retry<T, F, Fut>(&self, request: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let deadline = start + RETRY_BUDGET;
        let mut last_err: Error;

        loop {
            match call().await {
                Ok(value) => {
                    metrics::observe_api_request(request, start.elapsed(), false);

                    return Ok(value);
                }
                Err(err) => {
                    debug!(request, error = %err, "machine API call failed");
                    last_err = err;
                }
            }

            if Instant::now() + RETRY_INTERVAL >= deadline {
                break;
            }

            // A dead transport fails every retry the same way; probe it and
            // rebuild before trying again.
            if self.transport.version().await.is_err() {
                if let Err(err) = self.transport.reconnect().await {
                    warn!(request, error = %err, "machine API reconnect failed");
                }
            }

            tokio::time::sleep(RETRY_INTERVAL).await;
        }

        metrics::observe_api_request(request, start.elapsed(), true);

        Err(Error::platform_unavailable(format!(
            "{request} failed after {:?}: {last_err}",
            RETRY_BUDGET
        )))
    }
}
