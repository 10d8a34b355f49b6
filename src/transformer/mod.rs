//! Rule-driven node specification transformer.
//!
//! Operators describe per-node customization as a list of transformation
//! rules in the cloud configuration. Each rule carries a node selector and a
//! set of effects: annotations, labels, taints, platform metadata overrides
//! and feature flags. For every rule whose selector matches the node's
//! platform metadata the effects are applied in order; later rules win on
//! key collisions.
//!
//! String values are minijinja templates evaluated over the flattened
//! platform metadata, the SMBIOS system information and the node OS version.

pub mod functions;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use minijinja::{context, Environment, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::platform::{PlatformMetadata, SystemInformation};
use crate::selector::{self, NodeSelectorTerm};
use crate::{Error, Result};

/// Upper bound on a single template, to keep rule evaluation cheap.
const MAX_TEMPLATE_LEN: usize = 16 * 1024;

static NAME_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").expect("static"));
static DNS_SUBDOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("static")
});

/// Taints the node controllers own; rules may not shadow them.
const KUBERNETES_TAINTS: &[&str] = &[
    "node.kubernetes.io/not-ready",
    "node.kubernetes.io/unreachable",
    "node.kubernetes.io/memory-pressure",
    "node.kubernetes.io/disk-pressure",
    "node.kubernetes.io/network-unavailable",
    "node.kubernetes.io/pid-pressure",
];

/// Taints the cloud provider machinery owns.
const CLOUD_PROVIDER_TAINTS: &[&str] = &[
    "node.cloudprovider.kubernetes.io/uninitialized",
    "node.cloudprovider.kubernetes.io/shutdown",
];

/// One transformation rule: a selector plus the effects to apply.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeTerm {
    /// Rule name, for logs only.
    pub name: String,
    /// Selector terms ORed together; an absent selector matches every node.
    pub node_selector: Vec<NodeSelectorTerm>,
    /// Annotations to set, values templated.
    pub annotations: BTreeMap<String, String>,
    /// Labels to set, values templated.
    pub labels: BTreeMap<String, String>,
    /// Taints to set, keyed by taint name with `[value:]effect` values.
    pub taints: BTreeMap<String, String>,
    /// Platform metadata overrides, matched case-insensitively on field name.
    pub platform_metadata: BTreeMap<String, String>,
    /// Feature toggles for matching nodes.
    pub features: NodeFeatures,
}

/// Per-rule feature flags.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeFeatures {
    /// Scan node interfaces for public IPs even on platforms that expose
    /// them in metadata.
    #[serde(rename = "publicIPDiscovery")]
    pub public_ip_discovery: bool,
}

/// The accumulated output of all matching rules.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeSpec {
    /// Annotations to merge into the node.
    pub annotations: BTreeMap<String, String>,
    /// Labels to merge into the node.
    pub labels: BTreeMap<String, String>,
    /// Taints to apply, keyed by taint name with `[value:]effect` values.
    pub taints: BTreeMap<String, String>,
    /// Union of the feature flags of all matching rules.
    pub features: NodeFeatures,
}

/// Apply the transformation rules to the node's platform metadata.
///
/// Selector matching and template evaluation see the metadata as it was on
/// entry; overrides are written back into `metadata` but do not feed back
/// into later rules of the same run. The result is never nil: with no rules
/// configured an empty [`NodeSpec`] is returned.
pub fn transform(
    terms: &[NodeTerm],
    metadata: &mut PlatformMetadata,
    sysinfo: Option<&SystemInformation>,
    version: &str,
) -> Result<NodeSpec> {
    let mut node = NodeSpec::default();

    if terms.is_empty() {
        return Ok(node);
    }

    let mut env = Environment::new();
    functions::register(&mut env);

    let values = template_context(metadata, sysinfo, version);
    let attributes = metadata.attributes();

    for term in terms {
        if !selector::matches(&term.node_selector, &attributes)? {
            continue;
        }

        for (key, template) in &term.annotations {
            let rendered = render(&env, template, &values)
                .map_err(|e| Error::validation(format!("failed to transform annotation {key:?}: {e}")))?;

            if let Some(errs) = qualified_name_errors(key) {
                return Err(Error::validation(format!(
                    "invalid annotation name {key:?}: [{errs}]"
                )));
            }

            node.annotations.insert(key.clone(), rendered);
        }

        for (key, template) in &term.labels {
            let rendered = render(&env, template, &values)
                .map_err(|e| Error::validation(format!("failed to transform label {key:?}: {e}")))?;

            if let Some(errs) = qualified_name_errors(key) {
                return Err(Error::validation(format!(
                    "invalid label name {key:?}: [{errs}]"
                )));
            }

            if let Some(errs) = label_value_errors(&rendered) {
                return Err(Error::validation(format!(
                    "invalid label value {rendered:?}: [{errs}]"
                )));
            }

            node.labels.insert(key.clone(), rendered);
        }

        for (key, template) in &term.taints {
            let rendered = render(&env, template, &values)
                .map_err(|e| Error::validation(format!("failed to transform taint {key:?}: {e}")))?;

            if let Some(errs) = taint_name_errors(key) {
                return Err(Error::validation(format!(
                    "invalid taint name {key:?}: [{errs}]"
                )));
            }

            if let Some(errs) = taint_value_errors(&rendered) {
                return Err(Error::validation(format!(
                    "invalid taint value {rendered:?}: [{errs}]"
                )));
            }

            node.taints.insert(key.clone(), rendered);
        }

        for (key, template) in &term.platform_metadata {
            let rendered = render(&env, template, &values).map_err(|e| {
                Error::validation(format!("failed to transform platform metadata {key:?}: {e}"))
            })?;

            metadata.apply_override(key, &rendered);
        }

        if term.features.public_ip_discovery {
            node.features.public_ip_discovery = true;
        }
    }

    Ok(node)
}

fn template_context(
    metadata: &PlatformMetadata,
    sysinfo: Option<&SystemInformation>,
    version: &str,
) -> Value {
    let sysinfo = sysinfo.cloned().unwrap_or_default();

    context! {
        platform => metadata.platform,
        hostname => metadata.hostname,
        region => metadata.region,
        zone => metadata.zone,
        instance_type => metadata.instance_type,
        instance_id => metadata.instance_id,
        provider_id => metadata.provider_id,
        spot => metadata.spot,
        internal_dns => metadata.internal_dns,
        external_dns => metadata.external_dns,
        manufacturer => sysinfo.manufacturer,
        product_name => sysinfo.product_name,
        serial_number => sysinfo.serial_number,
        uuid => sysinfo.uuid,
        sku_number => sysinfo.sku_number,
        talos_version => version,
    }
}

fn render(env: &Environment<'_>, template: &str, values: &Value) -> Result<String> {
    if template.len() > MAX_TEMPLATE_LEN {
        return Err(Error::validation(format!(
            "template exceeds {MAX_TEMPLATE_LEN} bytes"
        )));
    }

    env.render_str(template, values)
        .map_err(|e| Error::validation(e.to_string()))
}

/// Validate a label or annotation key as a Kubernetes qualified name:
/// an optional DNS subdomain prefix, a slash, and a name part.
fn qualified_name_errors(name: &str) -> Option<String> {
    let parts: Vec<&str> = name.split('/').collect();

    let name_part = match parts.as_slice() {
        [name_part] => name_part,
        [prefix, name_part] => {
            if prefix.is_empty() || prefix.len() > 253 || !DNS_SUBDOMAIN_RE.is_match(prefix) {
                return Some(format!(
                    "prefix part {prefix:?} must be a lowercase RFC 1123 subdomain"
                ));
            }

            name_part
        }
        _ => {
            return Some(
                "a qualified name must consist of a name part, optionally prefixed by a subdomain and '/'"
                    .to_string(),
            )
        }
    };

    if name_part.is_empty() || name_part.len() > 63 || !NAME_PART_RE.is_match(name_part) {
        return Some(
            "name part must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character"
                .to_string(),
        );
    }

    None
}

/// Validate a label value: empty, or at most 63 characters of the name-part
/// alphabet.
fn label_value_errors(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }

    if value.len() > 63 || !NAME_PART_RE.is_match(value) {
        return Some(
            "a valid label value must be an empty string or consist of alphanumeric \
             characters, '-', '_' or '.', and must start and end with an alphanumeric character"
                .to_string(),
        );
    }

    None
}

fn taint_name_errors(name: &str) -> Option<String> {
    if name.contains("kubernetes.io/") {
        if KUBERNETES_TAINTS.contains(&name) {
            return Some("taint in kubernetes namespace".to_string());
        }

        if CLOUD_PROVIDER_TAINTS.contains(&name) {
            return Some("taint in cloud provider namespace".to_string());
        }
    }

    None
}

/// Validate a `[value:]effect` taint value.
fn taint_value_errors(value: &str) -> Option<String> {
    let parts: Vec<&str> = value.split(':').collect();

    let effect = match parts.as_slice() {
        [effect] => effect,
        [_, effect] => effect,
        _ => return Some("taint value is not valid".to_string()),
    };

    match *effect {
        "NoSchedule" | "PreferNoSchedule" | "NoExecute" => None,
        _ => Some(format!("taint effect {effect:?} is not valid")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{NodeSelectorRequirement, Operator};

    fn metadata() -> PlatformMetadata {
        PlatformMetadata {
            platform: "test-platform".to_string(),
            hostname: "test-hostname".to_string(),
            ..Default::default()
        }
    }

    fn pairs(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_rules_yield_empty_spec() {
        let mut meta = metadata();
        let spec = transform(&[], &mut meta, None, "").unwrap();

        assert_eq!(spec, NodeSpec::default());
    }

    #[test]
    fn plain_labels_and_annotations() {
        let mut meta = metadata();
        let terms = vec![NodeTerm {
            name: "my-transformer".to_string(),
            labels: pairs(&[("my-label-name", "my-value")]),
            annotations: pairs(&[("my-annotation-name", "my-annotation-value")]),
            ..Default::default()
        }];

        let spec = transform(&terms, &mut meta, None, "").unwrap();

        assert_eq!(spec.labels, pairs(&[("my-label-name", "my-value")]));
        assert_eq!(
            spec.annotations,
            pairs(&[("my-annotation-name", "my-annotation-value")])
        );
        assert!(spec.taints.is_empty());
    }

    #[test]
    fn taints_pass_through() {
        let mut meta = metadata();
        let terms = vec![NodeTerm {
            taints: pairs(&[("my-taint-name", "NoSchedule")]),
            ..Default::default()
        }];

        let spec = transform(&terms, &mut meta, None, "").unwrap();

        assert_eq!(spec.taints, pairs(&[("my-taint-name", "NoSchedule")]));
    }

    #[test]
    fn bad_template_is_an_error() {
        let mut meta = metadata();
        let terms = vec![NodeTerm {
            labels: pairs(&[("label-template", "my-value-{{ spot")]),
            ..Default::default()
        }];

        let err = transform(&terms, &mut meta, None, "").unwrap_err();
        assert!(err
            .to_string()
            .contains("failed to transform label \"label-template\""));
    }

    #[test]
    fn templates_see_metadata_fields() {
        let mut meta = metadata();
        let terms = vec![NodeTerm {
            annotations: pairs(&[("annotation-template", "my-value-{{ platform }}")]),
            ..Default::default()
        }];

        let spec = transform(&terms, &mut meta, None, "").unwrap();

        assert_eq!(
            spec.annotations,
            pairs(&[("annotation-template", "my-value-test-platform")])
        );
    }

    #[test]
    fn zero_values_render_as_zero_not_errors() {
        let mut meta = metadata();
        let terms = vec![NodeTerm {
            labels: pairs(&[("label-template", "my-value-{{ spot }}-{{ zone }}a")]),
            ..Default::default()
        }];

        let spec = transform(&terms, &mut meta, None, "").unwrap();

        assert_eq!(spec.labels, pairs(&[("label-template", "my-value-false-a")]));
    }

    #[test]
    fn metadata_overrides_write_back() {
        let mut meta = metadata();
        meta.spot = true;

        let terms = vec![NodeTerm {
            labels: pairs(&[(
                "karpenter.sh/capacity-type",
                "{% if spot %}spot{% else %}on-demand{% endif %}",
            )]),
            platform_metadata: pairs(&[("Zone", "us-west1")]),
            ..Default::default()
        }];

        let spec = transform(&terms, &mut meta, None, "").unwrap();

        assert_eq!(
            spec.labels,
            pairs(&[("karpenter.sh/capacity-type", "spot")])
        );
        assert_eq!(meta.zone, "us-west1");
        assert_eq!(meta.platform, "test-platform");
    }

    #[test]
    fn overrides_skip_reserved_and_unknown_fields() {
        let mut meta = PlatformMetadata {
            platform: "test-platform".to_string(),
            hostname: "type-c1m5-hostname".to_string(),
            ..Default::default()
        };

        let terms = vec![NodeTerm {
            platform_metadata: pairs(&[
                ("Hostname", "fake-hostname"),
                ("spot", "true"),
                ("zoNe", "us-west1"),
                ("wrong", "value"),
                (
                    "InstanceType",
                    "{{ regexFindString('^type-([a-z0-9]+)-(.*)$', hostname, 1) }}",
                ),
            ]),
            ..Default::default()
        }];

        transform(&terms, &mut meta, None, "").unwrap();

        assert_eq!(meta.hostname, "type-c1m5-hostname");
        assert!(meta.spot);
        assert_eq!(meta.zone, "us-west1");
        assert_eq!(meta.instance_type, "c1m5");
    }

    #[test]
    fn later_rules_win_and_effects_accumulate() {
        let mut meta = metadata();
        let terms = vec![
            NodeTerm {
                name: "first-rule".to_string(),
                annotations: pairs(&[("first-annotation", "first-value")]),
                labels: pairs(&[("karpenter.sh/capacity-type", "on-demand")]),
                ..Default::default()
            },
            NodeTerm {
                name: "second-rule".to_string(),
                labels: pairs(&[
                    ("karpenter.sh/capacity-type", "spot"),
                    (
                        "squat.ai/enabled",
                        "{% if semverCompare('>=1.8', talos_version) %}true{% endif %}",
                    ),
                ]),
                platform_metadata: pairs(&[("Zone", "us-west1")]),
                ..Default::default()
            },
        ];

        let spec = transform(&terms, &mut meta, None, "1.8.0").unwrap();

        assert_eq!(
            spec.annotations,
            pairs(&[("first-annotation", "first-value")])
        );
        assert_eq!(
            spec.labels,
            pairs(&[
                ("karpenter.sh/capacity-type", "spot"),
                ("squat.ai/enabled", "true"),
            ])
        );
        assert_eq!(meta.zone, "us-west1");
    }

    #[test]
    fn selector_gates_rule_effects() {
        let mut meta = metadata();
        let terms = vec![NodeTerm {
            node_selector: vec![NodeSelectorTerm {
                match_expressions: vec![NodeSelectorRequirement {
                    key: "Hostname".to_string(),
                    operator: Operator::Regexp,
                    values: vec!["^web-.+$".to_string()],
                }],
            }],
            labels: pairs(&[("node-role.kubernetes.io/web", "")]),
            ..Default::default()
        }];

        let spec = transform(&terms, &mut meta, None, "").unwrap();
        assert!(spec.labels.is_empty());

        meta.hostname = "web-1".to_string();
        let spec = transform(&terms, &mut meta, None, "").unwrap();
        assert_eq!(spec.labels, pairs(&[("node-role.kubernetes.io/web", "")]));
    }

    #[test]
    fn bad_label_name_is_an_error() {
        let mut meta = metadata();
        let terms = vec![NodeTerm {
            labels: pairs(&[("-template", "my-value")]),
            ..Default::default()
        }];

        let err = transform(&terms, &mut meta, None, "").unwrap_err();
        assert!(err.to_string().contains("invalid label name \"-template\""));
    }

    #[test]
    fn reserved_taint_names_are_rejected() {
        let mut meta = metadata();
        let terms = vec![NodeTerm {
            taints: pairs(&[("node.kubernetes.io/disk-pressure", "NoSchedule")]),
            ..Default::default()
        }];

        let err = transform(&terms, &mut meta, None, "").unwrap_err();
        assert!(err.to_string().contains("taint in kubernetes namespace"));

        let terms = vec![NodeTerm {
            taints: pairs(&[(
                "node.cloudprovider.kubernetes.io/uninitialized",
                "NoSchedule",
            )]),
            ..Default::default()
        }];

        let err = transform(&terms, &mut meta, None, "").unwrap_err();
        assert!(err.to_string().contains("taint in cloud provider namespace"));
    }

    #[test]
    fn custom_taints_in_kubernetes_like_namespaces_are_allowed() {
        let mut meta = metadata();
        let terms = vec![NodeTerm {
            taints: pairs(&[(
                "node.cloudprovider.kubernetes.io/storage-type",
                "ssd:NoSchedule",
            )]),
            ..Default::default()
        }];

        let spec = transform(&terms, &mut meta, None, "").unwrap();
        assert_eq!(
            spec.taints,
            pairs(&[("node.cloudprovider.kubernetes.io/storage-type", "ssd:NoSchedule")])
        );
    }

    #[test]
    fn bad_taint_effect_is_an_error() {
        let mut meta = metadata();
        let terms = vec![NodeTerm {
            taints: pairs(&[(
                "node.cloudprovider.kubernetes.io/storage-type",
                "my-value:PleaseSchedule",
            )]),
            ..Default::default()
        }];

        let err = transform(&terms, &mut meta, None, "").unwrap_err();
        assert!(err
            .to_string()
            .contains("taint effect \"PleaseSchedule\" is not valid"));
    }

    #[test]
    fn feature_flags_accumulate() {
        let mut meta = metadata();
        let terms = vec![
            NodeTerm::default(),
            NodeTerm {
                features: NodeFeatures {
                    public_ip_discovery: true,
                },
                ..Default::default()
            },
        ];

        let spec = transform(&terms, &mut meta, None, "").unwrap();
        assert!(spec.features.public_ip_discovery);
    }

    #[test]
    fn transform_is_idempotent() {
        let terms = vec![NodeTerm {
            labels: pairs(&[("karpenter.sh/capacity-type", "on-demand")]),
            annotations: pairs(&[("serial", "{{ serial_number }}")]),
            platform_metadata: pairs(&[("Zone", "us-west1")]),
            ..Default::default()
        }];

        let sysinfo = SystemInformation {
            serial_number: "S123".to_string(),
            ..Default::default()
        };

        let mut first_meta = metadata();
        let first = transform(&terms, &mut first_meta, Some(&sysinfo), "1.8.0").unwrap();

        let mut second_meta = first_meta.clone();
        let second = transform(&terms, &mut second_meta, Some(&sysinfo), "1.8.0").unwrap();

        assert_eq!(first, second);
        assert_eq!(first_meta, second_meta);
    }
}
