//! Pod CIDR allocation controller.
//!
//! Maintains one bitmap allocator per cluster CIDR (plus any IPv6
//! super-CIDRs discovered from nodes at runtime), assigns a pod CIDR from
//! each matching pool to new nodes, occupies recorded assignments on
//! startup, and releases them when nodes go away. Work arrives through a
//! deduplicating queue fed by a node watch; a fixed worker pool drains it.

pub mod cidrset;
pub mod queue;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use futures::TryStreamExt;
use ipnet::{IpNet, Ipv6Net};
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::{self, reflector, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::platform::PlatformClient;
use crate::{netutil, nodeutil, Error, Result};

use self::cidrset::CidrSet;
use self::queue::WorkQueue;

/// Size of the worker pool draining the node queue.
const CIDR_UPDATE_WORKERS: usize = 30;

/// Attempts at patching a node's pod CIDRs before giving up.
const CIDR_UPDATE_RETRIES: usize = 3;

/// Default node mask for IPv4 cluster CIDRs.
pub const DEFAULT_NODE_MASK_IPV4: u8 = 24;

/// Default node mask for IPv6 cluster CIDRs.
pub const DEFAULT_NODE_MASK_IPV6: u8 = 80;

/// Sizing inputs for the allocator.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocatorParams {
    /// Cluster CIDRs, at most two, at most one per family.
    pub cluster_cidrs: Vec<IpNet>,
    /// Service CIDRs to carve out of overlapping cluster CIDRs.
    pub service_cidrs: Vec<IpNet>,
    /// Node mask size per cluster CIDR, index-aligned.
    pub node_cidr_mask_sizes: Vec<u8>,
}

impl AllocatorParams {
    /// Validate cluster CIDRs and derive per-family node mask sizes from the
    /// optional flag values.
    pub fn build(
        cluster_cidrs: Vec<IpNet>,
        service_cidrs: Vec<IpNet>,
        mask_size: Option<u8>,
        mask_size_ipv4: Option<u8>,
        mask_size_ipv6: Option<u8>,
    ) -> Result<Self> {
        if cluster_cidrs.is_empty() {
            return Err(Error::config("no cluster CIDRs configured"));
        }

        if cluster_cidrs.len() > 2 {
            return Err(Error::config(format!(
                "len of clusters is:{} > more than max allowed of 2",
                cluster_cidrs.len()
            )));
        }

        if cluster_cidrs.len() == 2 {
            let v4 = cluster_cidrs.iter().filter(|c| matches!(c, IpNet::V4(_))).count();

            if v4 != 1 {
                return Err(Error::config(
                    "two cluster CIDRs must be dual stack, one from each IP family",
                ));
            }

            if mask_size.is_some() {
                return Err(Error::config(
                    "usage of --node-cidr-mask-size is not allowed with dual-stack clusters",
                ));
            }
        } else {
            let is_v6 = matches!(cluster_cidrs[0], IpNet::V6(_));

            if mask_size.is_some() && (mask_size_ipv4.is_some() || mask_size_ipv6.is_some()) {
                return Err(Error::config(
                    "usage of --node-cidr-mask-size-ipv4 and --node-cidr-mask-size-ipv6 is not allowed if --node-cidr-mask-size is set",
                ));
            }

            if mask_size_ipv4.is_some() && is_v6 {
                return Err(Error::config(
                    "usage of --node-cidr-mask-size-ipv4 is not allowed for a single-stack IPv6 cluster",
                ));
            }

            if mask_size_ipv6.is_some() && !is_v6 {
                return Err(Error::config(
                    "usage of --node-cidr-mask-size-ipv6 is not allowed for a single-stack IPv4 cluster",
                ));
            }
        }

        let ipv4_mask = mask_size.or(mask_size_ipv4).unwrap_or(DEFAULT_NODE_MASK_IPV4);
        let ipv6_mask = mask_size.or(mask_size_ipv6).unwrap_or(DEFAULT_NODE_MASK_IPV6);

        let node_cidr_mask_sizes = cluster_cidrs
            .iter()
            .map(|cidr| match cidr {
                IpNet::V4(_) => ipv4_mask,
                IpNet::V6(_) => ipv6_mask,
            })
            .collect();

        Ok(Self {
            cluster_cidrs,
            service_cidrs,
            node_cidr_mask_sizes,
        })
    }
}

/// Informer-driven pod CIDR allocator.
pub struct CidrAllocator {
    nodes: Api<Node>,
    store: Store<Node>,
    writer: Option<reflector::store::Writer<Node>>,
    queue: Arc<WorkQueue>,
    recorder: Recorder,
    platform: Arc<PlatformClient>,
    cluster_cidrs: Vec<IpNet>,
    sets: Mutex<HashMap<IpNet, Arc<CidrSet>>>,
}

impl CidrAllocator {
    /// Build the allocator: one CIDR set per cluster CIDR, with service
    /// CIDR ranges pre-occupied where they overlap.
    pub fn new(
        client: Client,
        platform: Arc<PlatformClient>,
        params: AllocatorParams,
    ) -> Result<Self> {
        let mut sets = HashMap::new();

        for (cidr, mask) in params
            .cluster_cidrs
            .iter()
            .zip(&params.node_cidr_mask_sizes)
        {
            let set = CidrSet::new(*cidr, *mask)?;
            sets.insert(set.cluster_cidr(), Arc::new(set));
        }

        for service_cidr in &params.service_cidrs {
            for set in sets.values() {
                if set.contains(&service_cidr.network())
                    || service_cidr.contains(&set.cluster_cidr().network())
                {
                    info!(%service_cidr, cluster_cidr = %set.cluster_cidr(), "carving service CIDR out of cluster CIDR");
                    set.occupy(service_cidr)?;
                }
            }
        }

        let (store, writer) = reflector::store();

        Ok(Self {
            nodes: Api::all(client.clone()),
            store,
            writer: Some(writer),
            queue: WorkQueue::new(),
            recorder: Recorder::new(
                client,
                Reporter {
                    controller: "cidrAllocator".to_string(),
                    instance: None,
                },
            ),
            platform,
            cluster_cidrs: params.cluster_cidrs,
            sets: Mutex::new(sets),
        })
    }

    /// Run the allocator until cancelled: start the node reflector, occupy
    /// the CIDRs of the initial node list, then let the worker pool drain
    /// the queue.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };

        info!("starting cloud CIDR allocator");

        let this = Arc::new(self);

        let pump = {
            let this = Arc::clone(&this);
            let shutdown = shutdown.clone();
            let stream = reflector(
                writer,
                watcher(this.nodes.clone(), watcher::Config::default()).default_backoff(),
            );

            tokio::spawn(async move {
                let mut stream = std::pin::pin!(stream);

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = stream.try_next() => match event {
                            Ok(Some(event)) => this.handle_event(&event),
                            Ok(None) => break,
                            Err(e) => warn!(error = %e, "node watch failed"),
                        },
                    }
                }
            })
        };

        this.store
            .wait_until_ready()
            .await
            .map_err(|e| Error::config(format!("node informer never became ready: {e}")))?;

        // Existing assignments must be occupied before anything is handed
        // out, otherwise a restart could double-allocate.
        for node in this.store.state() {
            if node
                .spec
                .as_ref()
                .and_then(|s| s.pod_cidrs.as_ref())
                .is_none_or(|c| c.is_empty())
            {
                continue;
            }

            this.occupy_pod_cidrs(&node).await?;
        }

        let workers: Vec<_> = (0..CIDR_UPDATE_WORKERS)
            .map(|_| {
                let this = Arc::clone(&this);

                tokio::spawn(async move { this.worker().await })
            })
            .collect();

        shutdown.cancelled().await;
        this.queue.shut_down();

        for worker in workers {
            let _ = worker.await;
        }

        pump.abort();
        info!("shutting down cloud CIDR allocator");

        Ok(())
    }

    fn handle_event(&self, event: &watcher::Event<Node>) {
        match event {
            watcher::Event::Apply(node) | watcher::Event::InitApply(node) => {
                if let Some(name) = node.metadata.name.as_deref() {
                    self.queue.add(name);
                }
            }
            watcher::Event::Delete(node) => {
                // The store no longer has the object; release directly from
                // the event, best-effort.
                if let Err(e) = self.release_node_cidrs(node) {
                    warn!(
                        node = node.metadata.name.as_deref().unwrap_or_default(),
                        error = %e,
                        "failed to release pod CIDRs of deleted node"
                    );
                }

                if let Some(name) = node.metadata.name.as_deref() {
                    self.queue.add(name);
                }
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    async fn worker(self: Arc<Self>) {
        while let Some(key) = self.queue.get().await {
            match self.sync_node(&key).await {
                Ok(()) => {
                    self.queue.forget(&key);
                    debug!(node = %key, "successfully synced");
                }
                Err(e) => {
                    warn!(node = %key, error = %e, "error syncing node, requeuing");
                    self.queue.add_rate_limited(&key);
                }
            }

            self.queue.done(&key);
        }
    }

    async fn sync_node(&self, key: &str) -> Result<()> {
        let Some(node) = self.store.get(&ObjectRef::new(key)) else {
            debug!(node = %key, "node has been deleted");

            return Ok(());
        };

        if node.metadata.deletion_timestamp.is_some() {
            debug!(node = %key, "node is being deleted");

            return self.release_node_cidrs(&node);
        }

        if nodeutil::has_uninitialized_taint(&node) {
            debug!(node = %key, "node has uninitialized taint, skipping CIDR allocation");

            return Ok(());
        }

        let pod_cidrs = node.spec.as_ref().and_then(|s| s.pod_cidrs.as_ref());

        if pod_cidrs.is_some_and(|c| !c.is_empty()) {
            return self.occupy_pod_cidrs(&node).await;
        }

        self.allocate_node_cidrs(&node).await
    }

    /// Mark the node's recorded pod CIDRs as used. CIDRs outside every known
    /// pool trigger IPv6 super-CIDR discovery before the lookup is retried.
    async fn occupy_pod_cidrs(&self, node: &Node) -> Result<()> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let cidrs = node
            .spec
            .as_ref()
            .and_then(|s| s.pod_cidrs.clone())
            .unwrap_or_default();

        if cidrs.is_empty() || cidrs.len() > 2 {
            return Ok(());
        }

        for cidr in &cidrs {
            let pod_cidr: IpNet = cidr
                .parse()
                .map_err(|e| Error::validation(format!("failed to parse node {name} CIDR {cidr}: {e}")))?;

            if self.occupy_cidr(&pod_cidr)? {
                continue;
            }

            self.discover_node_global_cidrs(node).await?;

            if !self.occupy_cidr(&pod_cidr)? {
                return Err(Error::cidr_conflict(format!(
                    "failed to find a CIDRSet for node {name}, CIDR {cidr}"
                )));
            }
        }

        Ok(())
    }

    /// Occupy the CIDR in the pool containing it; false when no pool does.
    fn occupy_cidr(&self, cidr: &IpNet) -> Result<bool> {
        let sets = self.sets.lock();

        for set in sets.values() {
            if set.contains(&cidr.network()) {
                set.occupy(cidr).map_err(|e| {
                    Error::cidr_conflict(format!(
                        "failed to mark cidr {cidr} as occupied in subnet {}: {e}",
                        set.cluster_cidr()
                    ))
                })?;

                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Allocate one subnet per cluster CIDR and patch the node.
    async fn allocate_node_cidrs(&self, node: &Node) -> Result<()> {
        let name = node.metadata.name.as_deref().unwrap_or_default();

        let global_v6 = self.discover_node_global_cidrs(node).await?;
        let mut allocated: Vec<IpNet> = Vec::with_capacity(self.cluster_cidrs.len());

        for cluster_cidr in &self.cluster_cidrs {
            // IPv6 allocations move into the node's discovered super-CIDR
            // when one is published.
            let lookup_ip = match (cluster_cidr, global_v6) {
                (IpNet::V6(_), Some(ip)) => ip,
                _ => cluster_cidr.network(),
            };

            let result = {
                let sets = self.sets.lock();

                sets.values()
                    .find(|set| set.contains(&lookup_ip))
                    .map(|set| set.allocate_next())
            };

            match result {
                Some(Ok(subnet)) => allocated.push(subnet),
                Some(Err(e)) => {
                    self.record_status_change(node, "CIDRNotAvailable").await;
                    self.release_cidrs(&allocated);

                    return Err(e);
                }
                None => {
                    self.record_status_change(node, "CIDRNotAvailable").await;
                    self.release_cidrs(&allocated);

                    return Err(Error::cidr_conflict(format!(
                        "no CIDR set covers {lookup_ip} for node {name}"
                    )));
                }
            }
        }

        self.update_cidrs_allocation(node, &allocated).await
    }

    /// Write the allocation onto the node, with bounded retries and the
    /// leak-avoidance rules around failure.
    async fn update_cidrs_allocation(&self, node: &Node, allocated: &[IpNet]) -> Result<()> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let cidr_strings: Vec<String> = allocated.iter().map(|c| c.to_string()).collect();

        let current = node
            .spec
            .as_ref()
            .and_then(|s| s.pod_cidrs.clone())
            .unwrap_or_default();

        // A previous patch may have gone through without being acknowledged.
        if current == cidr_strings {
            debug!(node = %name, ?cidr_strings, "node already has the proposed CIDRs");

            return Ok(());
        }

        if !current.is_empty() {
            error!(node = %name, ?current, "node already has a different CIDR allocation, releasing the new one");
            self.release_cidrs(allocated);

            return Ok(());
        }

        let mut last_err = None;

        for _ in 0..CIDR_UPDATE_RETRIES {
            match nodeutil::patch_node_cidrs(&self.nodes, name, &cidr_strings).await {
                Ok(()) => {
                    info!(node = %name, ?cidr_strings, "set node pod CIDRs");

                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        let err = last_err.unwrap_or(Error::NotFound(name.to_string()));
        error!(node = %name, error = %err, "failed to update node pod CIDRs after multiple attempts");
        self.record_status_change(node, "CIDRAssignmentFailed").await;

        // On a server timeout the patch may have landed; keep the CIDRs
        // reserved rather than risk a double allocation. A controller
        // restart reconciles either way.
        if !is_server_timeout(&err) {
            self.release_cidrs(allocated);
        }

        Err(err)
    }

    fn release_cidrs(&self, cidrs: &[IpNet]) {
        let sets = self.sets.lock();

        for cidr in cidrs {
            for set in sets.values() {
                if set.contains(&cidr.network()) {
                    if let Err(e) = set.release(cidr) {
                        warn!(%cidr, error = %e, "failed to release CIDR");
                    }

                    break;
                }
            }
        }
    }

    /// Release the node's recorded pod CIDRs.
    fn release_node_cidrs(&self, node: &Node) -> Result<()> {
        let Some(cidrs) = node.spec.as_ref().and_then(|s| s.pod_cidrs.as_ref()) else {
            return Ok(());
        };

        for cidr in cidrs {
            let parsed: IpNet = cidr
                .parse()
                .map_err(|e| Error::validation(format!("failed to parse CIDR {cidr}: {e}")))?;

            debug!(node = node.metadata.name.as_deref().unwrap_or_default(), %cidr, "releasing pod CIDR");
            self.release_cidrs(&[parsed]);
        }

        Ok(())
    }

    /// Find (or register) the IPv6 super-CIDR the node's addresses fall
    /// into. Returns an address inside the pool to allocate from, or `None`
    /// when the node publishes no usable IPv6 prefix.
    async fn discover_node_global_cidrs(&self, node: &Node) -> Result<Option<IpAddr>> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let node_ips = nodeutil::node_ips(node)?;

        if node_ips.is_empty() {
            return Err(Error::validation(format!("node {name} has no addresses")));
        }

        let mut interfaces = Vec::new();

        for ip in &node_ips {
            match self.platform.node_interfaces(&ip.to_string()).await {
                Ok(found) => {
                    interfaces = found;

                    break;
                }
                Err(e) => debug!(node = %name, %ip, error = %e, "interface query failed"),
            }
        }

        let public_v6: Vec<IpAddr> = node_ips
            .iter()
            .copied()
            .filter(|ip| ip.is_ipv6() && !netutil::is_private(ip))
            .collect();

        let prefixes = node_cidr_discovery(&public_v6, &interfaces);

        if prefixes.is_empty() {
            return Ok(None);
        }

        let mut sets = self.sets.lock();

        for set_cidr in sets.keys() {
            if matches!(set_cidr, IpNet::V4(_)) || netutil::is_private(&set_cidr.network()) {
                continue;
            }

            for prefix in &prefixes {
                if set_cidr.contains(&IpAddr::V6(prefix.addr())) {
                    return Ok(Some(set_cidr.network()));
                }
            }
        }

        for prefix in &prefixes {
            if prefix.prefix_len() == 128 {
                continue;
            }

            let (cluster_cidr, node_mask) = cidrset::normalize_v6(*prefix)?;
            let key = IpNet::V6(cluster_cidr);

            if !sets.contains_key(&key) {
                debug!(node = %name, %cluster_cidr, "registering discovered IPv6 CIDR set");
                sets.insert(key, Arc::new(CidrSet::new(key, node_mask)?));
            }
        }

        Ok(Some(IpAddr::V6(prefixes[0].addr())))
    }

    async fn record_status_change(&self, node: &Node, reason: &str) {
        let name = node.metadata.name.as_deref().unwrap_or_default();

        let event = Event {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(format!("Node {name} status is now: {reason}")),
            action: "CIDRAllocation".to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&event, &node.object_ref(&())).await {
            warn!(node = %name, error = %e, "failed to record status change event");
        }
    }
}

/// Public IPv6 prefixes of the node, computed from its interface list and
/// filtered to the given addresses. Permanent addresses sort first.
fn node_cidr_discovery(
    filter_ips: &[IpAddr],
    interfaces: &[crate::platform::InterfaceAddress],
) -> Vec<Ipv6Net> {
    let mut prefixes: Vec<Ipv6Net> = Vec::new();

    for iface in interfaces {
        if netutil::is_ignored_link(&iface.link_name) {
            continue;
        }

        let ip = iface.address.addr();

        if !netutil::is_global_unicast(&ip) || netutil::is_private(&ip) {
            continue;
        }

        if !filter_ips.is_empty() && !filter_ips.contains(&ip) {
            continue;
        }

        let IpNet::V6(prefix) = iface.address else {
            continue;
        };

        if prefixes.contains(&prefix) {
            continue;
        }

        if iface.flags.permanent() {
            prefixes.insert(0, prefix);
        } else {
            prefixes.push(prefix);
        }
    }

    prefixes
}

fn is_server_timeout(err: &Error) -> bool {
    match err {
        Error::Kube(kube::Error::Api(response)) => {
            response.reason == "ServerTimeout" || response.code == 504
        }
        _ => false,
    }
}
