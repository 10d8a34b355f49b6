//! Cloud configuration file handling.
//!
//! The configuration is optional YAML: a `global` section with controller
//! toggles and machine API endpoints, and a `transformations` list of
//! node transformation rules. The `TALOS_ENDPOINTS` environment variable
//! (comma-separated) supersedes `global.endpoints`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transformer::NodeTerm;
use crate::{Error, Result};

/// Root of the cloud configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    /// Global configuration.
    pub global: CloudConfigGlobal,
    /// Node transformation rules.
    pub transformations: Vec<NodeTerm>,
}

/// The `global` section of the cloud configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfigGlobal {
    /// Approve kubelet serving certificate signing requests.
    #[serde(rename = "approveNodeCSR")]
    pub approve_node_csr: bool,
    /// Cluster name for the clustername node label; falls back to the name
    /// recorded in the machine credentials.
    pub cluster_name: String,
    /// Machine API endpoints.
    pub endpoints: Vec<String>,
    /// Order IPv6 addresses before IPv4 in dual-stack address lists.
    #[serde(rename = "preferIPv6")]
    pub prefer_ipv6: bool,
}

impl CloudConfig {
    /// Parse a configuration document and apply environment overrides.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut config: CloudConfig = if raw.trim().is_empty() {
            CloudConfig::default()
        } else {
            serde_yaml::from_str(raw)
                .map_err(|e| Error::config(format!("failed to parse cloud config: {e}")))?
        };

        if let Ok(endpoints) = std::env::var("TALOS_ENDPOINTS") {
            if !endpoints.is_empty() {
                config.global.endpoints =
                    endpoints.split(',').map(|e| e.trim().to_string()).collect();
            }
        }

        debug!(?config, "cloud config loaded");

        Ok(config)
    }

    /// Load the configuration from a file; a missing path yields defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| Error::config(format!("failed to read {path}: {e}")))?;

                Self::parse(&raw)
            }
            None => Self::parse(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        let config = CloudConfig::parse("").unwrap();
        assert_eq!(config, CloudConfig::default());
        assert!(!config.global.approve_node_csr);
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
global:
  approveNodeCSR: true
  clusterName: talos-cluster
  endpoints:
    - 10.5.0.2
    - 10.5.0.3
  preferIPv6: true
transformations:
  - name: web-nodes
    nodeSelector:
      - matchExpressions:
          - key: hostname
            operator: Regexp
            values:
              - ^web-.+$
    labels:
      node-role.kubernetes.io/web: ""
    annotations:
      rack: "{{ getValue(serial_number, 'rack') }}"
    taints:
      dedicated: "web:NoSchedule"
    platformMetadata:
      Zone: us-west1
    features:
      publicIPDiscovery: true
"#;

        let config = CloudConfig::parse(raw).unwrap();

        assert!(config.global.approve_node_csr);
        assert_eq!(config.global.cluster_name, "talos-cluster");
        assert_eq!(config.global.endpoints, vec!["10.5.0.2", "10.5.0.3"]);
        assert!(config.global.prefer_ipv6);

        let rule = &config.transformations[0];
        assert_eq!(rule.name, "web-nodes");
        assert_eq!(rule.node_selector.len(), 1);
        assert!(rule.features.public_ip_discovery);
        assert_eq!(
            rule.taints.get("dedicated").map(String::as_str),
            Some("web:NoSchedule")
        );
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let err = CloudConfig::parse("global: [not a map").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
