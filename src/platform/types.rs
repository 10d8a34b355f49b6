//! Typed views of the machine API resources the controller consumes.

use std::collections::BTreeMap;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Cloud platform facts reported by a node, fetched from the node OS itself.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformMetadata {
    /// Lower-case cloud platform identifier ("metal", "gcp", "azure", ...).
    pub platform: String,
    /// Hostname the platform assigned to the node.
    pub hostname: String,
    /// Region the node runs in.
    pub region: String,
    /// Zone the node runs in.
    pub zone: String,
    /// Platform instance type.
    pub instance_type: String,
    /// Platform instance identifier.
    pub instance_id: String,
    /// Fully qualified provider ID, when the platform supplies one.
    #[serde(rename = "providerID")]
    pub provider_id: String,
    /// True for preemptible / spot instances.
    pub spot: bool,
    /// Platform-internal DNS name.
    #[serde(rename = "internalDNS")]
    pub internal_dns: String,
    /// Platform-external DNS name.
    #[serde(rename = "externalDNS")]
    pub external_dns: String,
}

impl PlatformMetadata {
    /// Flatten the metadata into the attribute map the selector engine
    /// matches against. Keys are lower-cased; empty string fields are
    /// omitted, booleans always appear.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();

        let pairs = [
            ("platform", &self.platform),
            ("hostname", &self.hostname),
            ("region", &self.region),
            ("zone", &self.zone),
            ("instancetype", &self.instance_type),
            ("instanceid", &self.instance_id),
            ("providerid", &self.provider_id),
            ("internaldns", &self.internal_dns),
            ("externaldns", &self.external_dns),
        ];

        for (key, value) in pairs {
            if !value.is_empty() {
                fields.insert(key.to_string(), value.clone());
            }
        }

        fields.insert("spot".to_string(), self.spot.to_string());

        fields
    }

    /// Write a transformation override back into the metadata.
    ///
    /// Field names match case-insensitively. `hostname` and `platform` are
    /// reserved and silently dropped, as are keys naming no metadata field;
    /// booleans are coerced from the literal string `"true"`; string values
    /// are trimmed.
    pub fn apply_override(&mut self, key: &str, value: &str) {
        let field = match key.to_lowercase().as_str() {
            // Reserved: identity fields cannot be rewritten by rules.
            "hostname" | "platform" => return,
            "region" => &mut self.region,
            "zone" => &mut self.zone,
            "instancetype" => &mut self.instance_type,
            "instanceid" => &mut self.instance_id,
            "providerid" => &mut self.provider_id,
            "internaldns" => &mut self.internal_dns,
            "externaldns" => &mut self.external_dns,
            "spot" => {
                self.spot = value == "true";

                return;
            }
            _ => return,
        };

        *field = value.trim().to_string();
    }
}

/// SMBIOS system information reported by a node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemInformation {
    /// Hardware manufacturer.
    pub manufacturer: String,
    /// Hardware product name.
    pub product_name: String,
    /// Serial number.
    pub serial_number: String,
    /// SMBIOS UUID.
    pub uuid: String,
    /// SKU number.
    pub sku_number: String,
}

/// Netlink address flags carried by an interface address.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AddressFlags(pub u32);

impl AddressFlags {
    /// The address is permanently configured, not autoconfigured.
    pub const PERMANENT: AddressFlags = AddressFlags(0x80);
    /// The address is a temporary (privacy) address.
    pub const TEMPORARY: AddressFlags = AddressFlags(0x01);

    /// True if all bits of `other` are set.
    pub fn contains(self, other: AddressFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True for permanently configured addresses.
    pub fn permanent(self) -> bool {
        self.contains(Self::PERMANENT)
    }
}

/// One address assigned to one link on a node.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceAddress {
    /// Name of the link carrying the address.
    #[serde(default)]
    pub link_name: String,
    /// The address with its prefix length.
    pub address: IpNet,
    /// Netlink address flags.
    #[serde(default)]
    pub flags: AddressFlags,
}

impl InterfaceAddress {
    /// Construct an interface address from its textual prefix form.
    pub fn new(link_name: &str, prefix: &str) -> Result<Self> {
        Ok(Self {
            link_name: link_name.to_string(),
            address: prefix
                .parse()
                .map_err(|e| Error::validation(format!("invalid prefix {prefix}: {e}")))?,
            flags: AddressFlags::default(),
        })
    }

    /// Same as [`InterfaceAddress::new`] with explicit flags.
    pub fn with_flags(link_name: &str, prefix: &str, flags: AddressFlags) -> Result<Self> {
        Ok(Self {
            flags,
            ..Self::new(link_name, prefix)?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> PlatformMetadata {
        PlatformMetadata {
            platform: "metal".to_string(),
            hostname: "web-1".to_string(),
            zone: "us-east-1a".to_string(),
            spot: false,
            ..Default::default()
        }
    }

    #[test]
    fn attributes_are_lowercased_and_sparse() {
        let fields = metadata().attributes();

        assert_eq!(fields.get("platform").map(String::as_str), Some("metal"));
        assert_eq!(fields.get("hostname").map(String::as_str), Some("web-1"));
        assert_eq!(fields.get("zone").map(String::as_str), Some("us-east-1a"));
        assert_eq!(fields.get("spot").map(String::as_str), Some("false"));
        // Empty string fields are not exposed to selectors.
        assert!(!fields.contains_key("region"));
        assert!(!fields.contains_key("instancetype"));
    }

    #[test]
    fn override_is_case_insensitive() {
        let mut meta = metadata();
        meta.apply_override("InstanceType", "c1.medium");
        assert_eq!(meta.instance_type, "c1.medium");

        meta.apply_override("SPOT", "true");
        assert!(meta.spot);

        meta.apply_override("spot", "yes");
        assert!(!meta.spot, "only the literal string true coerces to true");
    }

    #[test]
    fn override_trims_string_values() {
        let mut meta = metadata();
        meta.apply_override("zone", " us-west-2b\n");
        assert_eq!(meta.zone, "us-west-2b");
    }

    #[test]
    fn reserved_and_unknown_overrides_are_dropped_silently() {
        let mut meta = metadata();
        meta.apply_override("hostname", "other");
        meta.apply_override("Platform", "aws");
        meta.apply_override("wrong", "value");

        assert_eq!(meta.hostname, "web-1");
        assert_eq!(meta.platform, "metal");
    }

    #[test]
    fn address_flags() {
        assert!(AddressFlags(0x80).permanent());
        assert!(!AddressFlags(0x01).permanent());
        assert!(AddressFlags(0x81).contains(AddressFlags::PERMANENT));
    }
}
