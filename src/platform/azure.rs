//! Azure specific provider ID fix-ups.

use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

static RESOURCE_GROUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*/subscriptions/(?:.*)/resourceGroups/(.+)/providers/(?:.*)")
        .expect("static pattern")
});

/// Lower-case the resource group segment of an Azure resource ID.
///
/// Azure resource group names are case-insensitive, but the in-tree Azure
/// integrations compare provider IDs as strings and expect the lowered form.
pub fn convert_resource_group_name_to_lower(resource_id: &str) -> Result<String> {
    let captures = RESOURCE_GROUP_RE.captures(resource_id).ok_or_else(|| {
        Error::validation(format!(
            "{resource_id:?} isn't in Azure resource ID format {:?}",
            RESOURCE_GROUP_RE.as_str()
        ))
    })?;

    let resource_group = &captures[1];

    Ok(resource_id.replacen(resource_group, &resource_group.to_lowercase(), 1))
}
