//! Endpoint descriptions for result envelopes

use kite_common::{EndpointKind, EndpointSpec};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

static OS_NAME: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"os\.name:\s*'([^']*)'").ok());
static OS_VERSION: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"os\.version:\s*'([^']*)'").ok());

/// Operating system reported in a grid error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsInfo {
    pub name: String,
    pub version: String,
}

fn capture(pattern: &Option<Regex>, text: &str) -> Option<String> {
    pattern
        .as_ref()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Extract `os.name: '..', os.version: '..'` from driver error text
pub fn extract_os_info(text: &str) -> Option<OsInfo> {
    let name = capture(&OS_NAME, text)?;
    let version = capture(&OS_VERSION, text).unwrap_or_default();
    Some(OsInfo { name, version })
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn same_family(a: &str, b: &str) -> bool {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    ["win", "mac"]
        .iter()
        .any(|family| a.starts_with(family) && b.starts_with(family))
}

/// Platform for the destination record.
///
/// The negotiated platform wins over the configured one. A windows or mac
/// platform is refined with the OS version from error text when the two
/// agree on the family.
pub fn destination_platform(endpoint: &EndpointSpec, os: Option<&OsInfo>) -> Option<String> {
    let platform = endpoint
        .negotiated
        .platform
        .clone()
        .filter(|p| !p.eq_ignore_ascii_case("any"))
        .or_else(|| endpoint.platform.clone());

    match (platform, os) {
        (Some(platform), Some(os))
            if !platform.to_lowercase().starts_with("linux")
                && !is_numeric(&platform)
                && same_family(&platform, &os.name) =>
        {
            Some(format!("{} {}", os.name, os.version).trim().to_string())
        }
        (platform, _) => platform,
    }
}

fn base_record(endpoint: &EndpointSpec) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("kind".into(), json!(endpoint.kind.to_string()));
    match endpoint.kind {
        EndpointKind::Browser => record.insert("browser".into(), json!(endpoint.name)),
        EndpointKind::App => record.insert("app".into(), json!(endpoint.name)),
    };
    if let Some(mobile) = &endpoint.mobile {
        record.insert("mobile".into(), json!(mobile));
    }
    record
}

/// Endpoint as it was configured
pub fn target_json(endpoint: &EndpointSpec) -> Value {
    let mut record = base_record(endpoint);
    record.insert("version".into(), json!(endpoint.version));
    record.insert("platform".into(), json!(endpoint.platform));
    Value::Object(record)
}

/// Endpoint as the grid actually provided it
pub fn destination_json(endpoint: &EndpointSpec, os: Option<&OsInfo>) -> Value {
    let mut record = base_record(endpoint);
    let version = endpoint
        .negotiated
        .version
        .clone()
        .or_else(|| endpoint.version.clone());
    record.insert("version".into(), json!(version));
    record.insert("platform".into(), json!(destination_platform(endpoint, os)));
    Value::Object(record)
}
