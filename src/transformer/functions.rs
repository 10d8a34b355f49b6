//! Template functions and filters available to transformation rules.
//!
//! The set mirrors the helpers rule authors expect from sprig-style
//! templating: defaults and emptiness checks, string manipulation, bounded
//! regular expressions, semantic version helpers, base64 and the `getValue`
//! accessor for `k=v;k=v` metadata blobs.
//!
//! Template functions never touch the filesystem or the network; regex
//! compilation is size-limited so user-supplied patterns cannot blow up the
//! controller.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use minijinja::value::{Rest, ValueKind};
use minijinja::{Environment, Error, ErrorKind, Value};

/// Upper bound for a compiled template regex.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Register the full function set on a template environment.
pub fn register(env: &mut Environment<'_>) {
    env.add_filter("upper", upper);
    env.add_filter("lower", lower);
    env.add_filter("trim", trim);
    env.add_filter("trimPrefix", trim_prefix);
    env.add_filter("trimSuffix", trim_suffix);
    env.add_filter("replace", replace);
    env.add_filter("b64enc", b64enc);
    env.add_filter("b64dec", b64dec);
    env.add_filter("default", default_value);

    env.add_function("default", default_fn);
    env.add_function("empty", empty);
    env.add_function("coalesce", coalesce);
    env.add_function("ternary", ternary);
    env.add_function("contains", contains);
    env.add_function("hasPrefix", has_prefix);
    env.add_function("hasSuffix", has_suffix);
    env.add_function("regexFind", regex_find);
    env.add_function("regexFindString", regex_find_string);
    env.add_function("regexReplaceAll", regex_replace_all);
    env.add_function("semver", semver_component);
    env.add_function("semverCompare", semver_compare);
    env.add_function("getValue", get_value);
}

/// True for undefined, none, empty strings, zero numbers, false and empty
/// sequences.
fn is_empty(value: &Value) -> bool {
    if value.is_undefined() || value.is_none() {
        return true;
    }

    if let Some(s) = value.as_str() {
        return s.is_empty();
    }

    match value.kind() {
        ValueKind::Bool | ValueKind::Number => !value.is_true(),
        ValueKind::Seq | ValueKind::Map => value.len() == Some(0),
        _ => false,
    }
}

fn upper(value: &str) -> String {
    value.to_uppercase()
}

fn lower(value: &str) -> String {
    value.to_lowercase()
}

fn trim(value: &str) -> String {
    value.trim().to_string()
}

fn trim_prefix(value: &str, prefix: &str) -> String {
    value.strip_prefix(prefix).unwrap_or(value).to_string()
}

fn trim_suffix(value: &str, suffix: &str) -> String {
    value.strip_suffix(suffix).unwrap_or(value).to_string()
}

fn replace(value: &str, from: &str, to: &str) -> String {
    value.replace(from, to)
}

fn b64enc(value: &str) -> String {
    BASE64.encode(value.as_bytes())
}

fn b64dec(value: &str) -> Result<String, Error> {
    let bytes = BASE64.decode(value).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("base64 decode error: {e}"))
    })?;

    String::from_utf8(bytes).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("base64 decode produced invalid UTF-8: {e}"),
        )
    })
}

/// Filter form: `{{ zone | default("unknown") }}`.
fn default_value(value: Value, fallback: Value) -> Value {
    if is_empty(&value) {
        fallback
    } else {
        value
    }
}

/// Function form: `{{ default("unknown", zone) }}`.
fn default_fn(fallback: Value, given: Rest<Value>) -> Value {
    match given.first() {
        Some(value) if !is_empty(value) => value.clone(),
        _ => fallback,
    }
}

fn empty(value: Value) -> bool {
    is_empty(&value)
}

/// First non-empty argument, or none.
fn coalesce(values: Rest<Value>) -> Value {
    values
        .iter()
        .find(|v| !is_empty(v))
        .cloned()
        .unwrap_or(Value::from(()))
}

fn ternary(if_true: Value, if_false: Value, condition: bool) -> Value {
    if condition {
        if_true
    } else {
        if_false
    }
}

fn contains(needle: &str, haystack: &str) -> bool {
    haystack.contains(needle)
}

fn has_prefix(prefix: &str, value: &str) -> bool {
    value.starts_with(prefix)
}

fn has_suffix(suffix: &str, value: &str) -> bool {
    value.ends_with(suffix)
}

fn compile(pattern: &str) -> Result<regex::Regex, Error> {
    regex::RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("invalid regexp: {e}")))
}

/// First match of the pattern in the string, or empty.
fn regex_find(pattern: &str, value: &str) -> Result<String, Error> {
    Ok(compile(pattern)?
        .find(value)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default())
}

/// Capture group `n` of the first match, or empty when the group is absent.
fn regex_find_string(pattern: &str, value: &str, group: usize) -> Result<String, Error> {
    Ok(compile(pattern)?
        .captures(value)
        .and_then(|c| c.get(group))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default())
}

fn regex_replace_all(pattern: &str, value: &str, replacement: &str) -> Result<String, Error> {
    Ok(compile(pattern)?.replace_all(value, replacement).into_owned())
}

fn parse_version(version: &str) -> Result<semver::Version, Error> {
    semver::Version::parse(version.trim().trim_start_matches('v')).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid semver {version:?}: {e}"),
        )
    })
}

/// Extract one component of a semantic version: `semver("major", "v1.8.2")`.
fn semver_component(component: &str, version: &str) -> Result<String, Error> {
    let version = parse_version(version)?;

    match component {
        "major" => Ok(version.major.to_string()),
        "minor" => Ok(version.minor.to_string()),
        "patch" => Ok(version.patch.to_string()),
        "prerelease" => Ok(version.pre.to_string()),
        _ => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("unknown semver component {component:?}"),
        )),
    }
}

/// True if the version satisfies the constraint:
/// `semverCompare(">=1.8.0", talos_version)`.
fn semver_compare(constraint: &str, version: &str) -> Result<bool, Error> {
    let requirement = semver::VersionReq::parse(constraint).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid semver constraint {constraint:?}: {e}"),
        )
    })?;

    Ok(requirement.matches(&parse_version(version)?))
}

/// Look up a key in a `k=v;k=v` segment list; empty when absent.
fn get_value(source: &str, key: &str) -> String {
    for part in source.split(';') {
        let mut kv = part.splitn(2, '=');

        if kv.next() == Some(key) {
            return kv.next().unwrap_or_default().to_string();
        }
    }

    String::new()
}
