//! gRPC transport for the Talos machine API.
//!
//! Resources are fetched through the typed resource state service; node
//! scoping travels in the `nodes` request metadata, the way the machine API
//! proxies node-targeted calls. Credentials come from a talosconfig file:
//! the `TALOSCONFIG` environment variable, or the secret path mounted into
//! the controller pod.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::RwLock;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::debug;

use super::types::{InterfaceAddress, PlatformMetadata, SystemInformation};
use super::MachineTransport;
use crate::{Error, Result};

/// Default mount path of the machine credentials inside the controller pod.
const DEFAULT_TALOSCONFIG: &str = "/var/run/secrets/talos.dev/config";

/// Default machine API port.
const APID_PORT: u16 = 50000;

const VERSION_PATH: &str = "/machine.MachineService/Version";
const RESOURCE_GET_PATH: &str = "/resource.ResourceService/Get";
const RESOURCE_LIST_PATH: &str = "/resource.ResourceService/List";

mod proto {
    //! Hand-written message types for the narrow slice of the machine API
    //! this controller consumes.

    #![allow(missing_docs)]

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VersionRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VersionResponse {
        #[prost(string, tag = "1")]
        pub version: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetRequest {
        #[prost(string, tag = "1")]
        pub namespace: String,
        #[prost(string, tag = "2")]
        pub r#type: String,
        #[prost(string, tag = "3")]
        pub id: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetResponse {
        #[prost(message, optional, tag = "1")]
        pub resource: Option<Resource>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ListRequest {
        #[prost(string, tag = "1")]
        pub namespace: String,
        #[prost(string, tag = "2")]
        pub r#type: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ListResponse {
        #[prost(message, repeated, tag = "1")]
        pub resources: Vec<Resource>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Resource {
        #[prost(string, tag = "1")]
        pub id: String,
        /// Resource spec as a YAML document.
        #[prost(bytes = "vec", tag = "2")]
        pub spec: Vec<u8>,
    }
}

#[derive(Clone, Debug, Deserialize)]
struct TalosConfig {
    context: String,
    contexts: HashMap<String, TalosContext>,
}

#[derive(Clone, Debug, Deserialize)]
struct TalosContext {
    #[serde(default)]
    endpoints: Vec<String>,
    ca: String,
    crt: String,
    key: String,
}

impl TalosConfig {
    fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read talosconfig {path}: {e}")))?;

        serde_yaml::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse talosconfig {path}: {e}")))
    }

    fn current(&self) -> Result<&TalosContext> {
        self.contexts
            .get(&self.context)
            .ok_or_else(|| Error::config(format!("talosconfig context {:?} not found", self.context)))
    }
}

/// Spec payload of the controller manager configuration resource.
#[derive(Debug, Deserialize)]
struct ControllerManagerConfig {
    #[serde(default, rename = "podCIDRs")]
    pod_cidrs: Vec<String>,
    #[serde(default, rename = "serviceCIDRs")]
    service_cidrs: Vec<String>,
}

/// [`MachineTransport`] implementation over the machine API gRPC surface.
pub struct ApidTransport {
    endpoints: Vec<String>,
    tls: ClientTlsConfig,
    cluster_name: String,
    channel: RwLock<Channel>,
}

impl ApidTransport {
    /// Build a transport from configured endpoints and the talosconfig
    /// credentials file. An empty endpoint list falls back to the endpoints
    /// recorded in the talosconfig.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let path =
            std::env::var("TALOSCONFIG").unwrap_or_else(|_| DEFAULT_TALOSCONFIG.to_string());
        let config = TalosConfig::load(&path)?;
        let context = config.current()?;

        let endpoints = if endpoints.is_empty() {
            context.endpoints.clone()
        } else {
            endpoints.to_vec()
        };

        if endpoints.is_empty() {
            return Err(Error::config("no machine API endpoints configured"));
        }

        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(decode_pem(&context.ca, "ca")?))
            .identity(Identity::from_pem(
                decode_pem(&context.crt, "crt")?,
                decode_pem(&context.key, "key")?,
            ));

        let channel = build_channel(&endpoints, &tls)?;

        debug!(context = %config.context, ?endpoints, "machine API transport configured");

        Ok(Self {
            endpoints,
            tls,
            cluster_name: config.context.clone(),
            channel: RwLock::new(channel),
        })
    }

    async fn unary<Req, Resp>(&self, path: &'static str, req: Req, node: Option<&str>) -> Result<Resp>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        let channel = self.channel.read().await.clone();
        let mut grpc = tonic::client::Grpc::new(channel);

        grpc.ready()
            .await
            .map_err(|e| Error::platform_unavailable(format!("endpoint not ready: {e}")))?;

        let mut request = tonic::Request::new(req);

        if let Some(node) = node {
            let value = MetadataValue::try_from(node)
                .map_err(|e| Error::validation(format!("invalid node address {node:?}: {e}")))?;
            request.metadata_mut().insert("nodes", value);
        }

        let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
        let response = grpc
            .unary(request, PathAndQuery::from_static(path), codec)
            .await
            .map_err(|status| Error::platform_unavailable(format!("{path}: {status}")))?;

        Ok(response.into_inner())
    }

    async fn get_spec<T: serde::de::DeserializeOwned>(
        &self,
        node: Option<&str>,
        namespace: &str,
        resource_type: &str,
        id: &str,
    ) -> Result<T> {
        let response: proto::GetResponse = self
            .unary(
                RESOURCE_GET_PATH,
                proto::GetRequest {
                    namespace: namespace.to_string(),
                    r#type: resource_type.to_string(),
                    id: id.to_string(),
                },
                node,
            )
            .await?;

        let resource = response
            .resource
            .ok_or_else(|| Error::not_found(format!("{namespace}/{resource_type}/{id}")))?;

        serde_yaml::from_slice(&resource.spec)
            .map_err(|e| Error::validation(format!("failed to decode {resource_type} spec: {e}")))
    }

    async fn list_specs<T: serde::de::DeserializeOwned>(
        &self,
        node: Option<&str>,
        namespace: &str,
        resource_type: &str,
    ) -> Result<Vec<T>> {
        let response: proto::ListResponse = self
            .unary(
                RESOURCE_LIST_PATH,
                proto::ListRequest {
                    namespace: namespace.to_string(),
                    r#type: resource_type.to_string(),
                },
                node,
            )
            .await?;

        response
            .resources
            .into_iter()
            .map(|r| {
                serde_yaml::from_slice(&r.spec).map_err(|e| {
                    Error::validation(format!("failed to decode {resource_type} spec: {e}"))
                })
            })
            .collect()
    }

    async fn controller_manager_config(&self) -> Result<ControllerManagerConfig> {
        self.get_spec(
            None,
            "controlplane",
            "ControllerManagerConfigs.kubernetes.talos.dev",
            "kube-controller-manager",
        )
        .await
    }
}

#[async_trait]
impl MachineTransport for ApidTransport {
    async fn version(&self) -> Result<String> {
        let response: proto::VersionResponse =
            self.unary(VERSION_PATH, proto::VersionRequest {}, None).await?;

        Ok(response.version)
    }

    async fn node_version(&self, node_ip: &str) -> Result<String> {
        let response: proto::VersionResponse = self
            .unary(VERSION_PATH, proto::VersionRequest {}, Some(node_ip))
            .await?;

        Ok(response.version)
    }

    async fn node_metadata(&self, node_ip: &str) -> Result<PlatformMetadata> {
        self.get_spec(
            Some(node_ip),
            "runtime",
            "PlatformMetadatas.runtime.talos.dev",
            "platform-metadata",
        )
        .await
    }

    async fn node_interfaces(&self, node_ip: &str) -> Result<Vec<InterfaceAddress>> {
        self.list_specs(Some(node_ip), "network", "AddressStatuses.net.talos.dev")
            .await
    }

    async fn node_system_info(&self, node_ip: &str) -> Result<SystemInformation> {
        self.get_spec(
            Some(node_ip),
            "hardware",
            "SystemInformations.hardware.talos.dev",
            "systeminformation",
        )
        .await
    }

    async fn pod_cidrs(&self) -> Result<Vec<String>> {
        Ok(self.controller_manager_config().await?.pod_cidrs)
    }

    async fn service_cidrs(&self) -> Result<Vec<String>> {
        Ok(self.controller_manager_config().await?.service_cidrs)
    }

    fn cluster_name(&self) -> Option<String> {
        if self.cluster_name.is_empty() {
            None
        } else {
            Some(self.cluster_name.clone())
        }
    }

    async fn reconnect(&self) -> Result<()> {
        let channel = build_channel(&self.endpoints, &self.tls)?;
        *self.channel.write().await = channel;

        Ok(())
    }
}

fn build_channel(endpoints: &[String], tls: &ClientTlsConfig) -> Result<Channel> {
    let endpoints = endpoints
        .iter()
        .map(|e| {
            Endpoint::from_shared(endpoint_url(e))
                .map_err(|err| Error::config(format!("invalid endpoint {e:?}: {err}")))?
                .tls_config(tls.clone())
                .map_err(|err| Error::config(format!("TLS config for {e:?}: {err}")))
                .map(|ep| ep.connect_timeout(Duration::from_secs(10)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Channel::balance_list(endpoints.into_iter()))
}

/// Turn a configured endpoint into a URL, appending the default port when
/// none is given.
fn endpoint_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim();

    if endpoint.contains("://") {
        return endpoint.to_string();
    }

    // Bare IPv6 addresses need brackets before a port can be attached.
    if endpoint.parse::<std::net::Ipv6Addr>().is_ok() {
        return format!("https://[{endpoint}]:{APID_PORT}");
    }

    if endpoint.rsplit(':').next().is_some_and(|p| p.parse::<u16>().is_ok())
        && endpoint.matches(':').count() == 1
    {
        return format!("https://{endpoint}");
    }

    format!("https://{endpoint}:{APID_PORT}")
}

fn decode_pem(encoded: &str, what: &str) -> Result<String> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::config(format!("talosconfig {what} is not valid base64: {e}")))?;

    String::from_utf8(bytes)
        .map_err(|e| Error::config(format!("talosconfig {what} is not valid UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_forms() {
        assert_eq!(endpoint_url("10.5.0.2"), "https://10.5.0.2:50000");
        assert_eq!(endpoint_url("10.5.0.2:50000"), "https://10.5.0.2:50000");
        assert_eq!(endpoint_url("talos.example.com"), "https://talos.example.com:50000");
        assert_eq!(endpoint_url("2001:db8::1"), "https://[2001:db8::1]:50000");
        assert_eq!(endpoint_url("https://10.5.0.2:443"), "https://10.5.0.2:443");
    }

    #[test]
    fn talosconfig_parsing() {
        let raw = r#"
context: test-cluster
contexts:
  test-cluster:
    endpoints:
      - 10.5.0.2
    ca: Y2EtcGVt
    crt: Y3J0LXBlbQ==
    key: a2V5LXBlbQ==
"#;
        let config: TalosConfig = serde_yaml::from_str(raw).unwrap();
        let context = config.current().unwrap();

        assert_eq!(config.context, "test-cluster");
        assert_eq!(context.endpoints, vec!["10.5.0.2"]);
        assert_eq!(decode_pem(&context.ca, "ca").unwrap(), "ca-pem");
    }

    #[test]
    fn missing_context_is_a_config_error() {
        let raw = "context: other\ncontexts: {}\n";
        let config: TalosConfig = serde_yaml::from_str(raw).unwrap();

        assert!(matches!(config.current(), Err(Error::Config(_))));
    }

    #[test]
    fn controller_manager_spec_decoding() {
        let spec = b"podCIDRs:\n  - 10.244.0.0/16\nserviceCIDRs:\n  - 10.96.0.0/12\n";
        let config: ControllerManagerConfig = serde_yaml::from_slice(spec).unwrap();

        assert_eq!(config.pod_cidrs, vec!["10.244.0.0/16"]);
        assert_eq!(config.service_cidrs, vec!["10.96.0.0/12"]);
    }
}
