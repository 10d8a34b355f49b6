//! Node selector matching engine.
//!
//! Transformation rules select nodes with the familiar Kubernetes node
//! selector shape: a rule carries a list of terms which are ORed, and each
//! term carries a list of requirements which are ANDed. On top of the
//! standard operator set we support `Regexp` for matching against the raw
//! platform metadata fields.
//!
//! Keys are compared case-insensitively against the flattened metadata
//! attribute map; values are case-sensitive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Upper bound for a compiled selector regex, to keep user-supplied patterns
/// from exhausting memory at compile time.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// A list of selector requirements ANDed together. An empty term matches no
/// nodes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    /// A list of node selector requirements by metadata fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

/// A selector that contains a key, an operator and values relating the two.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    /// The metadata key that the selector applies to, case-insensitive.
    #[serde(default)]
    pub key: String,
    /// The operator relating the key to the values.
    #[serde(default)]
    pub operator: Operator,
    /// Operator operands. `In`/`NotIn` require a non-empty list, `Exists` and
    /// `DoesNotExist` require an empty one, `Gt`/`Lt`/`Regexp` require
    /// exactly one element.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// The set of operators usable in a node selector requirement.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum Operator {
    /// The attribute value is one of the listed values.
    #[default]
    In,
    /// The attribute value is none of the listed values.
    NotIn,
    /// The attribute is present, whatever its value.
    Exists,
    /// The attribute is absent.
    DoesNotExist,
    /// Both the attribute value and the operand parse as i64 and the
    /// attribute is greater.
    Gt,
    /// Both the attribute value and the operand parse as i64 and the
    /// attribute is smaller.
    Lt,
    /// The attribute value matches the operand regular expression.
    Regexp,
}

/// Returns true if the metadata attributes match the selector terms.
///
/// An empty term list matches every node; terms are ORed.
pub fn matches(terms: &[NodeSelectorTerm], fields: &BTreeMap<String, String>) -> Result<bool> {
    if terms.is_empty() {
        return Ok(true);
    }

    for term in terms {
        if matches_expressions(&term.match_expressions, fields)? {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Returns true if the metadata attributes match every requirement.
///
/// An empty requirement list matches nothing. A requirement whose key is
/// absent from the attribute map never matches, but is not an error; invalid
/// requirement shapes (wrong operand count, bad integers, bad regex) are
/// errors.
pub fn matches_expressions(
    requirements: &[NodeSelectorRequirement],
    fields: &BTreeMap<String, String>,
) -> Result<bool> {
    if requirements.is_empty() {
        return Ok(false);
    }

    for requirement in requirements {
        if !matches_requirement(requirement, fields)? {
            return Ok(false);
        }
    }

    Ok(true)
}

fn matches_requirement(
    requirement: &NodeSelectorRequirement,
    fields: &BTreeMap<String, String>,
) -> Result<bool> {
    let key = requirement.key.to_lowercase();
    let value = fields.get(&key);

    match requirement.operator {
        Operator::In => {
            if requirement.values.is_empty() {
                return Err(Error::validation(
                    "values must be non-empty for operator 'In'",
                ));
            }

            Ok(value.is_some_and(|v| requirement.values.iter().any(|c| c == v)))
        }
        Operator::NotIn => {
            if requirement.values.is_empty() {
                return Err(Error::validation(
                    "values must be non-empty for operator 'NotIn'",
                ));
            }

            Ok(value.is_some_and(|v| !requirement.values.iter().any(|c| c == v)))
        }
        Operator::Exists => {
            if !requirement.values.is_empty() {
                return Err(Error::validation(
                    "values must be empty for operator 'Exists'",
                ));
            }

            Ok(value.is_some())
        }
        Operator::DoesNotExist => {
            if !requirement.values.is_empty() {
                return Err(Error::validation(
                    "values must be empty for operator 'DoesNotExist'",
                ));
            }

            Ok(value.is_none())
        }
        Operator::Gt | Operator::Lt => {
            if requirement.values.len() != 1 {
                return Err(Error::validation(format!(
                    "values must have a single element for operator '{:?}'",
                    requirement.operator
                )));
            }

            let Some(value) = value else {
                return Ok(false);
            };

            let lhs: i64 = value
                .parse()
                .map_err(|_| Error::validation(format!("failed to parse value {value} as int")))?;
            let rhs: i64 = requirement.values[0].parse().map_err(|_| {
                Error::validation(format!(
                    "failed to parse value {} as int",
                    requirement.values[0]
                ))
            })?;

            Ok(match requirement.operator {
                Operator::Gt => lhs > rhs,
                _ => lhs < rhs,
            })
        }
        Operator::Regexp => {
            if requirement.values.len() != 1 {
                return Err(Error::validation(
                    "values must have a single element for operator 'Regexp'",
                ));
            }

            let Some(value) = value else {
                return Ok(false);
            };

            let re = regex::RegexBuilder::new(&requirement.values[0])
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(|e| {
                    Error::validation(format!(
                        "invalid regexp {:?}: {e}",
                        requirement.values[0]
                    ))
                })?;

            Ok(re.is_match(value))
        }
    }
}
