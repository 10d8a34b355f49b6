//! Node object helpers shared by the controllers.

use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::debug;

use crate::{Error, Result};

/// Annotation carrying the comma-separated IPs the kubelet registered with.
pub const PROVIDED_NODE_IP_ANNOTATION: &str = "alpha.kubernetes.io/provided-node-ip";

/// Taint the kubelet applies at registration until a cloud provider
/// completes node setup.
pub const UNINITIALIZED_TAINT_KEY: &str = "node.cloudprovider.kubernetes.io/uninitialized";

/// Taint the node lifecycle controller applies to unready nodes.
pub const NOT_READY_TAINT_KEY: &str = "node.kubernetes.io/not-ready";

/// Field manager recorded on node patches.
pub const FIELD_MANAGER: &str = "talos-cloud-controller-manager";

/// The provided-IP annotation split into its entries, if present.
pub fn provided_node_ips(node: &Node) -> Option<Vec<String>> {
    let annotations = node.metadata.annotations.as_ref()?;
    let provided = annotations.get(PROVIDED_NODE_IP_ANNOTATION)?;

    Some(
        provided
            .split(',')
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .collect(),
    )
}

/// All IPs recorded on the node: the internal/external status addresses
/// first, then any provided IPs not already present.
pub fn node_ips(node: &Node) -> Result<Vec<IpAddr>> {
    let mut ips: Vec<IpAddr> = Vec::new();

    if let Some(addresses) = node.status.as_ref().and_then(|s| s.addresses.as_ref()) {
        for address in addresses {
            if address.type_ != "InternalIP" && address.type_ != "ExternalIP" {
                continue;
            }

            let ip = address
                .address
                .parse()
                .map_err(|e| Error::validation(format!("failed to parse IP address: {e}")))?;

            ips.push(ip);
        }
    }

    for provided in provided_node_ips(node).unwrap_or_default() {
        let ip: IpAddr = provided
            .parse()
            .map_err(|e| Error::validation(format!("failed to parse IP address: {e}")))?;

        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }

    Ok(ips)
}

/// True if the node carries a taint with the given key.
pub fn has_taint(node: &Node, key: &str) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| t.key == key))
}

/// True if the node still carries the uninitialized cloud taint.
pub fn has_uninitialized_taint(node: &Node) -> bool {
    has_taint(node, UNINITIALIZED_TAINT_KEY)
}

/// Build a taint from a `[value:]effect` rule entry.
pub fn taint_from_entry(key: &str, entry: &str) -> Taint {
    let parts: Vec<&str> = entry.split(':').collect();

    match parts.as_slice() {
        [value, effect] => Taint {
            key: key.to_string(),
            value: Some(value.to_string()),
            effect: effect.to_string(),
            time_added: None,
        },
        _ => Taint {
            key: key.to_string(),
            value: None,
            effect: entry.to_string(),
            time_added: None,
        },
    }
}

/// Add the given taints to a node, updating entries with matching keys and
/// leaving everything else in place. Never removes a taint.
pub async fn add_or_update_taints(api: &Api<Node>, node: &Node, taints: &[Taint]) -> Result<()> {
    let name = node.metadata.name.as_deref().unwrap_or_default();

    let mut merged = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();
    let mut changed = false;

    for taint in taints {
        match merged.iter_mut().find(|t| t.key == taint.key) {
            Some(existing) => {
                if existing.value != taint.value || existing.effect != taint.effect {
                    *existing = taint.clone();
                    changed = true;
                }
            }
            None => {
                merged.push(taint.clone());
                changed = true;
            }
        }
    }

    if !changed {
        return Ok(());
    }

    debug!(node = %name, taints = merged.len(), "updating node taints");

    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Strategic(json!({ "spec": { "taints": merged } })),
    )
    .await?;

    Ok(())
}

/// Remove a taint by key; a no-op if the node does not carry it.
pub async fn remove_taint(api: &Api<Node>, node: &Node, key: &str) -> Result<()> {
    let name = node.metadata.name.as_deref().unwrap_or_default();

    let Some(taints) = node.spec.as_ref().and_then(|s| s.taints.as_ref()) else {
        return Ok(());
    };

    if !taints.iter().any(|t| t.key == key) {
        return Ok(());
    }

    let remaining: Vec<&Taint> = taints.iter().filter(|t| t.key != key).collect();

    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Strategic(json!({ "spec": { "taints": remaining } })),
    )
    .await?;

    Ok(())
}

/// Patch `spec.podCIDR` and `spec.podCIDRs` on a node.
pub async fn patch_node_cidrs(api: &Api<Node>, name: &str, cidrs: &[String]) -> Result<()> {
    let patch = json!({
        "spec": {
            "podCIDR": cidrs.first(),
            "podCIDRs": cidrs,
        }
    });

    debug!(node = %name, ?cidrs, "patching node pod CIDRs");

    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Strategic(patch))
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn node_with_annotation(ip: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("talos-1".to_string()),
                annotations: Some(BTreeMap::from([(
                    PROVIDED_NODE_IP_ANNOTATION.to_string(),
                    ip.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn provided_ips_split_on_commas() {
        let node = node_with_annotation("192.168.0.1,fd00:192:168::1");
        assert_eq!(
            provided_node_ips(&node).unwrap(),
            vec!["192.168.0.1", "fd00:192:168::1"]
        );

        assert_eq!(provided_node_ips(&Node::default()), None);
    }

    #[test]
    fn node_ips_merges_status_and_provided() {
        let mut node = node_with_annotation("192.168.0.1,2000::1");
        node.status = Some(NodeStatus {
            addresses: Some(vec![
                NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: "192.168.0.1".to_string(),
                },
                NodeAddress {
                    type_: "Hostname".to_string(),
                    address: "talos-1".to_string(),
                },
            ]),
            ..Default::default()
        });

        let ips = node_ips(&node).unwrap();
        let rendered: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();

        // Status address first, provided IPs deduplicated then appended.
        assert_eq!(rendered, vec!["192.168.0.1", "2000::1"]);
    }

    #[test]
    fn node_ips_rejects_garbage() {
        let node = node_with_annotation("not-an-ip");
        assert!(node_ips(&node).is_err());
    }

    #[test]
    fn taint_entry_forms() {
        let plain = taint_from_entry("dedicated", "NoSchedule");
        assert_eq!(plain.value, None);
        assert_eq!(plain.effect, "NoSchedule");

        let valued = taint_from_entry("dedicated", "web:NoExecute");
        assert_eq!(valued.value.as_deref(), Some("web"));
        assert_eq!(valued.effect, "NoExecute");
    }

    #[test]
    fn taint_detection() {
        let node = Node {
            spec: Some(NodeSpec {
                taints: Some(vec![Taint {
                    key: UNINITIALIZED_TAINT_KEY.to_string(),
                    effect: "NoSchedule".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(has_uninitialized_taint(&node));
        assert!(!has_taint(&node, NOT_READY_TAINT_KEY));
        assert!(!has_uninitialized_taint(&Node::default()));
    }
}
