//! Kubelet serving certificate request policy.
//!
//! The controller only ever approves requests that look exactly like a
//! kubelet asking for its serving certificate: the subject identifies a
//! node, the SANs name that node, and the key usage set is the serving set.
//! Everything else is denied with a reason.

use std::net::IpAddr;

use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509CertificationRequest};

use crate::{Error, Result};

/// Key usage strings of a CertificateSigningRequest object.
const USAGE_DIGITAL_SIGNATURE: &str = "digital signature";
const USAGE_KEY_ENCIPHERMENT: &str = "key encipherment";
const USAGE_SERVER_AUTH: &str = "server auth";

/// The parts of an X.509 certificate request the policy inspects.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CertificateRequestInfo {
    /// Subject common name.
    pub common_name: String,
    /// Subject organization entries.
    pub organizations: Vec<String>,
    /// DNS subject alternative names.
    pub dns_names: Vec<String>,
    /// IP subject alternative names.
    pub ip_addresses: Vec<IpAddr>,
    /// Email subject alternative names.
    pub email_addresses: Vec<String>,
    /// URI subject alternative names.
    pub uris: Vec<String>,
}

/// Decode a PEM-encoded certificate request and extract the policy-relevant
/// fields.
pub fn parse_csr(pem_bytes: &[u8]) -> Result<CertificateRequestInfo> {
    let block = pem::parse(pem_bytes)
        .map_err(|_| Error::validation("PEM block type must be CERTIFICATE REQUEST"))?;

    if block.tag() != "CERTIFICATE REQUEST" {
        return Err(Error::validation(
            "PEM block type must be CERTIFICATE REQUEST",
        ));
    }

    let (_, csr) = X509CertificationRequest::from_der(block.contents())
        .map_err(|e| Error::validation(format!("failed to parse certificate request: {e}")))?;

    let subject = &csr.certification_request_info.subject;

    let mut info = CertificateRequestInfo {
        common_name: subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string(),
        organizations: subject
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect(),
        ..Default::default()
    };

    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            let ParsedExtension::SubjectAlternativeName(san) = extension else {
                continue;
            };

            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns) => info.dns_names.push(dns.to_string()),
                    GeneralName::RFC822Name(email) => {
                        info.email_addresses.push(email.to_string())
                    }
                    GeneralName::URI(uri) => info.uris.push(uri.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_san_bytes(bytes) {
                            info.ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(info)
}

fn ip_from_san_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Check a request against the kubelet serving certificate policy.
///
/// Returns the denial reason on failure.
pub fn validate_kubelet_serving(
    req: &CertificateRequestInfo,
    usages: &[String],
) -> std::result::Result<(), String> {
    if req.dns_names.is_empty() && req.ip_addresses.is_empty() {
        return Err("DNS or IP subjectAltName is required".to_string());
    }

    if req
        .dns_names
        .iter()
        .any(|name| name == "kubernetes" || name.starts_with("kubernetes."))
    {
        return Err("DNS subjectAltNames are not allowed".to_string());
    }

    if !req.email_addresses.is_empty() {
        return Err("email subjectAltNames are not allowed".to_string());
    }

    if !req.uris.is_empty() {
        return Err("URI subjectAltNames are not allowed".to_string());
    }

    if req.organizations != ["system:nodes"] {
        return Err("subject organization is not system:nodes".to_string());
    }

    if !req.common_name.starts_with("system:node:") {
        return Err("subject common name does not begin with system:node:".to_string());
    }

    validate_usages(usages)
}

/// The usage set must be {DigitalSignature, ServerAuth}, optionally plus
/// KeyEncipherment, and nothing else.
fn validate_usages(usages: &[String]) -> std::result::Result<(), String> {
    let allowed = [
        USAGE_KEY_ENCIPHERMENT,
        USAGE_DIGITAL_SIGNATURE,
        USAGE_SERVER_AUTH,
    ];

    if usages.iter().any(|u| !allowed.contains(&u.as_str())) {
        return Err("key usage does not match".to_string());
    }

    let has = |usage: &str| usages.iter().any(|u| u == usage);

    if has(USAGE_SERVER_AUTH) && has(USAGE_DIGITAL_SIGNATURE) {
        Ok(())
    } else {
        Err("key usage does not match".to_string())
    }
}
