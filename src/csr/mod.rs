//! Kubelet serving certificate approval controller.
//!
//! Watches the CSR collection in sessions of at most five minutes,
//! restarting with a 10 s pause after watch errors. Only newly added
//! requests are considered; each one is screened, checked against the
//! serving certificate policy and the recorded node addresses, and then
//! approved or denied with a single appended condition.

pub mod policy;

use std::collections::HashSet;

use futures::TryStreamExt;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, WatchParams};
use kube::core::WatchEvent;
use kube::Client;
use serde_json::json;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{metrics, netutil, nodeutil, Error, Result};

use self::policy::CertificateRequestInfo;

/// Signer name of kubelet serving certificates.
const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";

/// Username prefix of node clients.
const NODE_USER_PREFIX: &str = "system:node:";

/// Upper bound of one watch session. The API server closes the watch at the
/// requested timeout; a fresh session is opened immediately.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Pause after a failed watch request.
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// The outcome of screening a certificate signing request.
#[derive(Debug, PartialEq)]
enum Screening {
    /// Not a request this controller decides; leave it alone.
    Ignore(String),
    /// Policy violation; deny with the reason.
    Deny(String),
    /// Policy passed; cross-check the SAN IPs against the node.
    CheckNode(CertificateRequestInfo),
}

/// Certificate signing request approval controller.
pub struct CsrController {
    csrs: Api<CertificateSigningRequest>,
    nodes: Api<Node>,
}

impl CsrController {
    /// Build the controller on a cluster client.
    pub fn new(client: Client) -> Self {
        Self {
            csrs: Api::all(client.clone()),
            nodes: Api::all(client),
        }
    }

    /// Run the watch loop until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("starting certificate signing request controller");

        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let stream = match self.csrs.watch(&wp, "0").await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "failed to watch certificate signing requests");

                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(WATCH_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let mut stream = std::pin::pin!(stream);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("certificate signing request controller shutting down");

                        return;
                    }
                    event = stream.try_next() => match event {
                        Ok(Some(WatchEvent::Added(csr))) => self.process(&csr).await,
                        Ok(Some(_)) => continue,
                        Ok(None) => {
                            // Server timeout closed the session; open a new one.
                            debug!("certificate signing request watch session expired");

                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "certificate signing request watch failed");

                            break;
                        }
                    },
                }
            }
        }
    }

    async fn process(&self, csr: &CertificateSigningRequest) {
        let name = csr.metadata.name.as_deref().unwrap_or_default();

        match self.decide(csr).await {
            Ok(None) => {}
            Ok(Some((approved, reason))) => {
                if let Err(e) = self.update_approval(csr, approved, &reason).await {
                    error!(csr = %name, error = %e, "failed to update approval");

                    return;
                }

                metrics::observe_csr_decision(approved);

                if approved {
                    info!(csr = %name, "certificate signing request approved");
                } else {
                    warn!(csr = %name, reason = %reason, "certificate signing request denied");
                }
            }
            Err(e) => error!(csr = %name, error = %e, "failed to reconcile certificate signing request"),
        }
    }

    /// Full decision for one request: `None` to leave it alone, otherwise
    /// the approval flag and reason to write.
    async fn decide(&self, csr: &CertificateSigningRequest) -> Result<Option<(bool, String)>> {
        match screen(csr)? {
            Screening::Ignore(reason) => {
                debug!(csr = %csr.metadata.name.as_deref().unwrap_or_default(), %reason, "ignoring certificate signing request");

                Ok(None)
            }
            Screening::Deny(reason) => Ok(Some((false, reason))),
            Screening::CheckNode(info) => {
                let node_name = info
                    .dns_names
                    .first()
                    .ok_or_else(|| Error::validation("certificate request carries no node name"))?;

                let node = self.nodes.get(node_name).await.map_err(|e| {
                    Error::validation(format!("failed to get node {node_name}: {e}"))
                })?;

                match node_ip_mismatch(&info, &node) {
                    Some(reason) => Ok(Some((false, reason))),
                    None => Ok(Some((true, "all checks passed".to_string()))),
                }
            }
        }
    }

    async fn update_approval(
        &self,
        csr: &CertificateSigningRequest,
        approved: bool,
        reason: &str,
    ) -> Result<()> {
        let name = csr.metadata.name.as_deref().unwrap_or_default();

        let condition = if approved {
            CertificateSigningRequestCondition {
                type_: "Approved".to_string(),
                status: "True".to_string(),
                reason: Some("Approved by TalosCloudControllerManager".to_string()),
                message: Some(
                    "This CSR was approved by Talos Cloud Controller Manager".to_string(),
                ),
                last_update_time: Some(Time(chrono::Utc::now())),
                last_transition_time: None,
            }
        } else {
            CertificateSigningRequestCondition {
                type_: "Denied".to_string(),
                status: "True".to_string(),
                reason: Some("Denied by TalosCloudControllerManager".to_string()),
                message: Some(format!(
                    "This CSR was denied by Talos Cloud Controller Manager, Reason: {reason}"
                )),
                last_update_time: Some(Time(chrono::Utc::now())),
                last_transition_time: None,
            }
        };

        let mut conditions = csr
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        conditions.push(condition);

        self.csrs
            .patch_approval(
                name,
                &PatchParams::apply(nodeutil::FIELD_MANAGER),
                &Patch::Merge(json!({ "status": { "conditions": conditions } })),
            )
            .await?;

        Ok(())
    }
}

/// Apply the cheap screening checks in order. Requests failing them are not
/// this controller's to decide; a malformed certificate request is an error.
fn screen(csr: &CertificateSigningRequest) -> Result<Screening> {
    let spec = &csr.spec;
    let status = csr.status.as_ref();

    if status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| !c.is_empty())
    {
        return Ok(Screening::Ignore(format!(
            "already approved or denied, signer {}",
            spec.signer_name
        )));
    }

    if spec.signer_name != KUBELET_SERVING_SIGNER {
        return Ok(Screening::Ignore(format!(
            "not a kubelet serving certificate, signer {}",
            spec.signer_name
        )));
    }

    if !spec
        .username
        .as_deref()
        .unwrap_or_default()
        .starts_with(NODE_USER_PREFIX)
    {
        return Ok(Screening::Ignore(
            "requesting user is not a node".to_string(),
        ));
    }

    if status.and_then(|s| s.certificate.as_ref()).is_some() {
        return Ok(Screening::Ignore(format!(
            "already signed, username {}",
            spec.username.as_deref().unwrap_or_default()
        )));
    }

    let info = policy::parse_csr(&spec.request.0)?;

    let usages = spec.usages.clone().unwrap_or_default();

    match policy::validate_kubelet_serving(&info, &usages) {
        Ok(()) => Ok(Screening::CheckNode(info)),
        Err(reason) => Ok(Screening::Deny(reason)),
    }
}

/// Cross-check the request's IP SANs against the node's provided IPs and
/// status addresses. Returns the denial reason on mismatch.
fn node_ip_mismatch(info: &CertificateRequestInfo, node: &Node) -> Option<String> {
    let mut node_addrs: HashSet<String> = HashSet::new();

    for provided in nodeutil::provided_node_ips(node).unwrap_or_default() {
        node_addrs.insert(netutil::canonical_ip(&provided).unwrap_or(provided));
    }

    if let Some(addresses) = node.status.as_ref().and_then(|s| s.addresses.as_ref()) {
        for address in addresses {
            node_addrs.insert(
                netutil::canonical_ip(&address.address)
                    .unwrap_or_else(|| address.address.clone()),
            );
        }
    }

    for ip in &info.ip_addresses {
        if !node_addrs.contains(&ip.to_string()) {
            return Some(format!(
                "CSR {} Node IP addresses don't match corresponding Node IP addresses {:?}, got {ip}",
                info.dns_names.first().map(String::as_str).unwrap_or_default(),
                node_addrs,
            ));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::certificates::v1::{
        CertificateSigningRequestSpec, CertificateSigningRequestStatus,
    };
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    const NODE_CSR: &str = "-----BEGIN CERTIFICATE REQUEST-----
MIIBGzCBwgIBADA1MRUwEwYDVQQKDAxzeXN0ZW06bm9kZXMxHDAaBgNVBAMME3N5
c3RlbTpub2RlOnRhbG9zLTEwWTATBgcqhkjOPQIBBggqhkjOPQMBBwNCAAT2HlD8
Ol5MWHO+5/CahijRUVigqJiAj9oOAamew+DrmekCrNe1G4ojVB+Rn8zvURqOIDsP
go7hQ8RtrIlSrMYKoCswKQYJKoZIhvcNAQkOMRwwGjAYBgNVHREEETAPggd0YWxv
cy0xhwQBAgMEMAoGCCqGSM49BAMCA0gAMEUCIQD8oruBPVwbYwq1hF14zks+M5iI
HwRgoC9wQPZ0fVTb8wIgO/p21SNLtBkylRsxXSB6cXvSaq9HXFGJQR2TLnIEeyw=
-----END CERTIFICATE REQUEST-----";

    fn serving_csr() -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some("csr-x7k2p".to_string()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(NODE_CSR.as_bytes().to_vec()),
                signer_name: KUBELET_SERVING_SIGNER.to_string(),
                username: Some("system:node:talos-1".to_string()),
                usages: Some(vec![
                    "digital signature".to_string(),
                    "server auth".to_string(),
                ]),
                ..Default::default()
            },
            status: None,
        }
    }

    fn node_with_internal_ip(ip: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("talos-1".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: ip.to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn serving_request_reaches_node_check() {
        let screening = screen(&serving_csr()).unwrap();

        match screening {
            Screening::CheckNode(info) => {
                assert_eq!(info.dns_names, vec!["talos-1"]);
            }
            other => panic!("expected node check, got {other:?}"),
        }
    }

    #[test]
    fn existing_conditions_are_ignored() {
        let mut csr = serving_csr();
        csr.status = Some(CertificateSigningRequestStatus {
            conditions: Some(vec![CertificateSigningRequestCondition {
                type_: "Approved".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        assert!(matches!(screen(&csr).unwrap(), Screening::Ignore(_)));
    }

    #[test]
    fn foreign_signer_is_ignored() {
        let mut csr = serving_csr();
        csr.spec.signer_name = "kubernetes.io/kube-apiserver-client-kubelet".to_string();

        assert!(matches!(screen(&csr).unwrap(), Screening::Ignore(_)));
    }

    #[test]
    fn non_node_user_is_ignored() {
        let mut csr = serving_csr();
        csr.spec.username = Some("system:serviceaccount:kube-system:bot".to_string());

        assert!(matches!(screen(&csr).unwrap(), Screening::Ignore(_)));
    }

    #[test]
    fn already_signed_is_ignored() {
        let mut csr = serving_csr();
        csr.status = Some(CertificateSigningRequestStatus {
            certificate: Some(ByteString(b"cert".to_vec())),
            ..Default::default()
        });

        assert!(matches!(screen(&csr).unwrap(), Screening::Ignore(_)));
    }

    #[test]
    fn malformed_request_is_an_error() {
        let mut csr = serving_csr();
        csr.spec.request = ByteString(b"garbage".to_vec());

        assert!(screen(&csr).is_err());
    }

    #[test]
    fn policy_violation_becomes_denial() {
        let mut csr = serving_csr();
        csr.spec.usages = Some(vec!["client auth".to_string()]);

        match screen(&csr).unwrap() {
            Screening::Deny(reason) => assert_eq!(reason, "key usage does not match"),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn matching_node_ip_passes() {
        let info = CertificateRequestInfo {
            dns_names: vec!["talos-1".to_string()],
            ip_addresses: vec!["1.2.3.4".parse().unwrap()],
            ..Default::default()
        };

        assert_eq!(node_ip_mismatch(&info, &node_with_internal_ip("1.2.3.4")), None);
    }

    #[test]
    fn mismatched_node_ip_is_denied() {
        let info = CertificateRequestInfo {
            dns_names: vec!["talos-1".to_string()],
            ip_addresses: vec!["1.2.3.4".parse().unwrap()],
            ..Default::default()
        };

        let reason = node_ip_mismatch(&info, &node_with_internal_ip("9.9.9.9")).unwrap();
        assert!(reason.contains("Node IP addresses don't match"));
        assert!(reason.contains("1.2.3.4"));
    }

    #[test]
    fn provided_ip_annotation_counts_as_node_address() {
        let info = CertificateRequestInfo {
            dns_names: vec!["talos-1".to_string()],
            ip_addresses: vec!["fd00:192:168::1".parse().unwrap()],
            ..Default::default()
        };

        let node = Node {
            metadata: ObjectMeta {
                name: Some("talos-1".to_string()),
                // Uncompressed form on the node, canonical in the CSR.
                annotations: Some(BTreeMap::from([(
                    nodeutil::PROVIDED_NODE_IP_ANNOTATION.to_string(),
                    "fd00:192:168:0::1".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(node_ip_mismatch(&info, &node), None);
    }

    #[test]
    fn request_without_ip_sans_passes_node_check() {
        let info = CertificateRequestInfo {
            dns_names: vec!["talos-1".to_string()],
            ..Default::default()
        };

        assert_eq!(node_ip_mismatch(&info, &node_with_internal_ip("9.9.9.9")), None);
    }
}
