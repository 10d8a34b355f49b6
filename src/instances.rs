//! Per-node metadata reconciliation and address resolution.
//!
//! When a kubelet registers with the uninitialized cloud taint, the node
//! initialization loop picks it up, fetches its platform metadata over the
//! machine API, runs the transformation rules, resolves its addresses and
//! writes everything back: provider ID, addresses, labels, annotations and
//! rule-supplied taints. Once the node object is complete the taint is
//! removed and scheduling opens up.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Node, NodeAddress};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::{
    CLUSTER_NAME_NODE_LABEL, CLUSTER_NODE_LIFECYCLE_LABEL, CLUSTER_NODE_PLATFORM_LABEL,
    PROVIDER_NAME,
};
use crate::config::CloudConfig;
use crate::nodeipam::queue::WorkQueue;
use crate::platform::{azure, InterfaceAddress, PlatformClient, PlatformMetadata};
use crate::transformer::{self, NodeFeatures};
use crate::{metrics, netutil, nodeutil, Error, Result};

/// Workers draining the node initialization queue.
const NODE_INIT_WORKERS: usize = 2;

/// Platforms that do not expose public IPs in their metadata; public
/// addresses are discovered from the interface list instead.
const IP_DISCOVERY_PLATFORMS: &[&str] = &["nocloud", "metal", "openstack", "oracle"];

/// Node age below which a missing instance is still treated as booting.
const SHUTDOWN_GRACE_SECONDS: i64 = 30;

/// Instance facts handed back to the initialization loop.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceMetadata {
    /// Fully qualified provider ID of the node.
    pub provider_id: String,
    /// Platform instance type.
    pub instance_type: String,
    /// Resolved node addresses.
    pub addresses: Vec<NodeAddress>,
    /// Zone the node runs in.
    pub zone: String,
    /// Region the node runs in.
    pub region: String,
}

/// The instance metadata surface and its reconciliation loop.
pub struct Instances {
    nodes: Api<Node>,
    config: Arc<CloudConfig>,
    platform: Arc<PlatformClient>,
}

impl Instances {
    /// Build the instance surface.
    pub fn new(client: Client, config: Arc<CloudConfig>, platform: Arc<PlatformClient>) -> Self {
        Self {
            nodes: Api::all(client),
            config,
            platform,
        }
    }

    /// Compute the instance metadata of a node.
    ///
    /// Returns `Ok(None)` when the node carries no provided-IP annotation,
    /// which means its kubelet is not running with an external cloud
    /// provider; there is nothing to reconcile then.
    pub async fn instance_metadata(&self, node: &Node) -> Result<Option<InstanceMetadata>> {
        let name = node.metadata.name.as_deref().unwrap_or_default();

        let Some(provided_ips) = nodeutil::provided_node_ips(node) else {
            warn!(node = %name, "no provided-IP annotation, is the kubelet running with --cloud-provider=external?");

            return Ok(None);
        };

        let node_ips =
            netutil::preferred_dual_stack_node_ips(self.config.global.prefer_ipv6, &provided_ips);

        if node_ips.is_empty() {
            return Err(Error::validation(format!(
                "node {name} has no usable provided IPs"
            )));
        }

        // The first IP that answers the metadata query becomes the node IP
        // for every following call.
        let mut selected = None;

        for ip in &node_ips {
            match self.platform.node_metadata(ip).await {
                Ok(meta) => {
                    selected = Some((ip.clone(), meta));

                    break;
                }
                Err(e) => debug!(node = %name, %ip, error = %e, "metadata query failed"),
            }
        }

        let Some((node_ip, mut meta)) = selected else {
            return Err(Error::platform_unavailable(format!(
                "error getting metadata from the node {name}"
            )));
        };

        debug!(node = %name, platform = %meta.platform, "fetched platform metadata");

        let spec = self.transform_node(name, &mut meta, &node_ip).await?;

        let provider_id = derive_provider_id(&meta, &node_ip);

        let interfaces = self.platform.node_interfaces(&node_ip).await?;

        let mut addresses = node_addresses(
            self.config.global.prefer_ipv6,
            &meta.platform,
            Some(&spec.features),
            &node_ips,
            &interfaces,
        );
        finalize_addresses(&mut addresses, name, &meta.hostname);

        self.sync_annotations(node, &spec.annotations).await?;

        // Rule-driven taints only apply while the node is still coming up;
        // after the uninitialized taint is gone the node belongs to the
        // scheduler.
        if !spec.taints.is_empty() && nodeutil::has_uninitialized_taint(node) {
            let taints: Vec<_> = spec
                .taints
                .iter()
                .map(|(key, value)| nodeutil::taint_from_entry(key, value))
                .collect();

            nodeutil::add_or_update_taints(&self.nodes, node, &taints).await?;
        }

        let mut labels = self.platform_labels(&meta);
        labels.extend(spec.labels.clone());
        self.sync_labels(node, &labels).await?;

        Ok(Some(InstanceMetadata {
            provider_id,
            instance_type: meta.instance_type.clone(),
            addresses,
            zone: meta.zone.clone(),
            region: meta.region.clone(),
        }))
    }

    /// True unless the one recognized shutdown pattern applies: an
    /// initialized spot instance on GCP that went unready right after
    /// boot-up is assumed to have been preempted.
    pub fn instance_exists(&self, node: &Node) -> bool {
        !preempted_gcp_spot(node)
    }

    /// Shutdown detection is left to the node lifecycle machinery.
    pub fn instance_shutdown(&self, _node: &Node) -> bool {
        false
    }

    /// Run the node initialization loop until cancelled: watch for nodes
    /// carrying the uninitialized taint, reconcile each one, then clear the
    /// taint.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("starting node initialization loop");

        let queue = WorkQueue::new();

        let pump = {
            let queue = Arc::clone(&queue);
            let shutdown = shutdown.clone();
            let stream =
                watcher(self.nodes.clone(), watcher::Config::default()).default_backoff();

            tokio::spawn(async move {
                let mut stream = std::pin::pin!(stream);

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = stream.try_next() => match event {
                            Ok(Some(watcher::Event::Apply(node)))
                            | Ok(Some(watcher::Event::InitApply(node))) => {
                                if nodeutil::has_uninitialized_taint(&node) {
                                    if let Some(name) = node.metadata.name.as_deref() {
                                        queue.add(name);
                                    }
                                }
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => break,
                            Err(e) => warn!(error = %e, "node watch failed"),
                        },
                    }
                }
            })
        };

        let workers: Vec<_> = (0..NODE_INIT_WORKERS)
            .map(|_| {
                let this = Arc::clone(&self);
                let queue = Arc::clone(&queue);

                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        match this.initialize_node(&key).await {
                            Ok(()) => queue.forget(&key),
                            Err(e) => {
                                warn!(node = %key, error = %e, "node initialization failed, requeuing");
                                queue.add_rate_limited(&key);
                            }
                        }

                        queue.done(&key);
                    }
                })
            })
            .collect();

        shutdown.cancelled().await;
        queue.shut_down();

        for worker in workers {
            let _ = worker.await;
        }

        pump.abort();
        info!("node initialization loop stopped");
    }

    async fn initialize_node(&self, name: &str) -> Result<()> {
        let node = match self.nodes.get(name).await {
            Ok(node) => node,
            Err(kube::Error::Api(response)) if response.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if !nodeutil::has_uninitialized_taint(&node) {
            return Ok(());
        }

        let Some(meta) = self.instance_metadata(&node).await? else {
            return Ok(());
        };

        let has_provider_id = node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.as_ref())
            .is_some_and(|id| !id.is_empty());

        if !has_provider_id && !meta.provider_id.is_empty() {
            self.nodes
                .patch(
                    name,
                    &PatchParams::apply(nodeutil::FIELD_MANAGER),
                    &Patch::Strategic(json!({ "spec": { "providerID": meta.provider_id } })),
                )
                .await?;
        }

        if !meta.addresses.is_empty() {
            self.nodes
                .patch_status(
                    name,
                    &PatchParams::apply(nodeutil::FIELD_MANAGER),
                    &Patch::Strategic(json!({ "status": { "addresses": meta.addresses } })),
                )
                .await?;
        }

        let mut labels = BTreeMap::new();

        if !meta.instance_type.is_empty() {
            labels.insert(
                "node.kubernetes.io/instance-type".to_string(),
                meta.instance_type.clone(),
            );
        }

        if !meta.region.is_empty() {
            labels.insert("topology.kubernetes.io/region".to_string(), meta.region.clone());
        }

        if !meta.zone.is_empty() {
            labels.insert("topology.kubernetes.io/zone".to_string(), meta.zone.clone());
        }

        self.sync_labels(&node, &labels).await?;

        // Re-read before clearing the taint so a concurrent spec update is
        // not clobbered.
        let fresh = self.nodes.get(name).await?;
        nodeutil::remove_taint(&self.nodes, &fresh, nodeutil::UNINITIALIZED_TAINT_KEY).await?;

        info!(node = %name, provider_id = %meta.provider_id, "node initialized");

        Ok(())
    }

    async fn transform_node(
        &self,
        name: &str,
        meta: &mut PlatformMetadata,
        node_ip: &str,
    ) -> Result<transformer::NodeSpec> {
        if self.config.transformations.is_empty() {
            return Ok(transformer::NodeSpec::default());
        }

        let version = self.platform.node_version(node_ip).await?;
        let sysinfo = self.platform.node_system_info(node_ip).await?;

        let start = Instant::now();
        let result = transformer::transform(
            &self.config.transformations,
            meta,
            Some(&sysinfo),
            &version,
        );
        metrics::observe_transformer("node", start.elapsed(), result.is_err());

        result.map_err(|e| {
            Error::validation(format!("failed to transform node {name} metadata: {e}"))
        })
    }

    fn platform_labels(&self, meta: &PlatformMetadata) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();

        if !meta.platform.is_empty() {
            labels.insert(CLUSTER_NODE_PLATFORM_LABEL.to_string(), meta.platform.clone());
        }

        if meta.spot {
            labels.insert(CLUSTER_NODE_LIFECYCLE_LABEL.to_string(), "spot".to_string());
        }

        let cluster_name = if self.config.global.cluster_name.is_empty() {
            self.platform.cluster_name().unwrap_or_default()
        } else {
            self.config.global.cluster_name.clone()
        };

        if !cluster_name.is_empty() {
            labels.insert(CLUSTER_NAME_NODE_LABEL.to_string(), cluster_name);
        }

        labels
    }

    async fn sync_annotations(
        &self,
        node: &Node,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let changed = changed_entries(node.metadata.annotations.as_ref(), annotations);

        if changed.is_empty() {
            return Ok(());
        }

        let name = node.metadata.name.as_deref().unwrap_or_default();
        debug!(node = %name, count = changed.len(), "updating node annotations");

        self.nodes
            .patch(
                name,
                &PatchParams::apply(nodeutil::FIELD_MANAGER),
                &Patch::Strategic(json!({ "metadata": { "annotations": changed } })),
            )
            .await?;

        Ok(())
    }

    async fn sync_labels(&self, node: &Node, labels: &BTreeMap<String, String>) -> Result<()> {
        let changed = changed_entries(node.metadata.labels.as_ref(), labels);

        if changed.is_empty() {
            return Ok(());
        }

        let name = node.metadata.name.as_deref().unwrap_or_default();
        debug!(node = %name, count = changed.len(), "updating node labels");

        self.nodes
            .patch(
                name,
                &PatchParams::apply(nodeutil::FIELD_MANAGER),
                &Patch::Strategic(json!({ "metadata": { "labels": changed } })),
            )
            .await?;

        Ok(())
    }
}

/// The one shutdown-detection shortcut: an already-initialized node that is
/// labelled as a GCP spot instance, is past its boot-up grace period and
/// carries the not-ready taint has most likely been preempted.
fn preempted_gcp_spot(node: &Node) -> bool {
    let initialized = node
        .spec
        .as_ref()
        .and_then(|s| s.provider_id.as_ref())
        .is_some_and(|id| !id.is_empty());

    if !initialized || !nodeutil::has_taint(node, nodeutil::NOT_READY_TAINT_KEY) {
        return false;
    }

    let old_enough = node
        .metadata
        .creation_timestamp
        .as_ref()
        .is_some_and(|created| {
            chrono::Utc::now().signed_duration_since(created.0)
                > chrono::Duration::seconds(SHUTDOWN_GRACE_SECONDS)
        });

    if !old_enough {
        return false;
    }

    let labels = node.metadata.labels.clone().unwrap_or_default();

    labels.get(CLUSTER_NODE_PLATFORM_LABEL).map(String::as_str) == Some("gcp")
        && labels.get(CLUSTER_NODE_LIFECYCLE_LABEL).map(String::as_str) == Some("spot")
}

/// The entries of `desired` that are missing from or different in
/// `current`.
fn changed_entries(
    current: Option<&BTreeMap<String, String>>,
    desired: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    desired
        .iter()
        .filter(|(key, value)| current.and_then(|c| c.get(*key)) != Some(value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Provider ID of the node: the metadata-supplied one, or
/// `talos://<platform>/<node IP>` when the platform supplies none. Azure
/// resource IDs get their resource group segment lowered.
fn derive_provider_id(meta: &PlatformMetadata, node_ip: &str) -> String {
    let provider_id = if meta.provider_id.is_empty() {
        format!("{PROVIDER_NAME}://{}/{node_ip}", meta.platform)
    } else {
        meta.provider_id.clone()
    };

    if meta.platform == "azure" {
        match azure::convert_resource_group_name_to_lower(&provider_id) {
            Ok(lowered) => return lowered,
            Err(e) => warn!(provider_id = %provider_id, error = %e, "provider ID is not an Azure resource ID"),
        }
    }

    provider_id
}

/// Public IPs discovered from the interface list, split by family. Provided
/// node IPs and anything on the ignored links are skipped; permanent IPv6
/// addresses sort ahead of temporary ones.
fn ip_discovery(
    node_ips: &[String],
    interfaces: &[InterfaceAddress],
) -> (Vec<String>, Vec<String>) {
    let mut public_v4 = Vec::new();
    let mut public_v6 = Vec::new();

    for iface in interfaces {
        if netutil::is_ignored_link(&iface.link_name) {
            continue;
        }

        let ip = iface.address.addr();

        if !netutil::is_global_unicast(&ip) || netutil::is_private(&ip) {
            continue;
        }

        let rendered = ip.to_string();

        if node_ips.contains(&rendered) {
            continue;
        }

        if ip.is_ipv6() {
            if iface.flags.permanent() {
                public_v6.insert(0, rendered);
            } else {
                public_v6.push(rendered);
            }
        } else {
            public_v4.push(rendered);
        }
    }

    (public_v4, public_v6)
}

/// Resolve the ordered node address list from the provided IPs and the
/// interface list.
pub fn node_addresses(
    prefer_ipv6: bool,
    platform: &str,
    features: Option<&NodeFeatures>,
    node_ips: &[String],
    interfaces: &[InterfaceAddress],
) -> Vec<NodeAddress> {
    let (mut public_v4, mut public_v6) = if IP_DISCOVERY_PLATFORMS.contains(&platform) {
        ip_discovery(node_ips, interfaces)
    } else {
        // Clouds that report public IPs in metadata surface them on a
        // dedicated link.
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();

        for iface in interfaces {
            if iface.link_name != "external" {
                continue;
            }

            let ip = iface.address.addr();
            let rendered = ip.to_string();

            if node_ips.contains(&rendered) {
                continue;
            }

            if ip.is_ipv6() {
                v6.push(rendered);
            } else {
                v4.push(rendered);
            }
        }

        (v4, v6)
    };

    if features.is_some_and(|f| f.public_ip_discovery) {
        let (extra_v4, extra_v6) = ip_discovery(node_ips, interfaces);
        public_v4.extend(extra_v4);
        public_v6.extend(extra_v6);
    }

    let mut addresses = Vec::new();

    for ip in netutil::preferred_dual_stack_node_ips(prefer_ipv6, node_ips) {
        addresses.push(NodeAddress {
            type_: "InternalIP".to_string(),
            address: ip,
        });
    }

    let mut public = public_v4;
    public.append(&mut public_v6);

    for ip in netutil::preferred_dual_stack_node_ips(prefer_ipv6, &public) {
        addresses.push(NodeAddress {
            type_: "ExternalIP".to_string(),
            address: ip,
        });
    }

    addresses
}

/// Append the hostname entries: the node name, and the platform hostname as
/// internal DNS when it is fully qualified.
pub fn finalize_addresses(addresses: &mut Vec<NodeAddress>, node_name: &str, hostname: &str) {
    addresses.push(NodeAddress {
        type_: "Hostname".to_string(),
        address: node_name.to_string(),
    });

    if hostname.find('.').is_some_and(|index| index > 0) {
        addresses.push(NodeAddress {
            type_: "InternalDNS".to_string(),
            address: hostname.to_string(),
        });
    }
}
