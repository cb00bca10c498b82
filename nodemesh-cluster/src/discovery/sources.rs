//! Parsing of external node-list responses
//!
//! Sources publish endpoint lists in a handful of shapes. A body is matched
//! against the known shapes in order; entries that do not fit their shape are
//! skipped individually and a body matching no shape is a parse error.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use nodemesh_core::DiscoverySourceConfig;

use super::node_registry::{Node, NodeSource};
use crate::error::{Error, Result};

/// Priority offset for discovered nodes, so seed and custom nodes win ties
pub const DISCOVERED_PRIORITY_BASE: u32 = 100;

/// Known response shapes
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePayload {
    /// Chain-registry style: `{"apis":{"rpc":[{address,provider}],"rest":[..]}}`
    ChainRegistry { rpc: Vec<Value>, rest: Vec<Value> },
    /// `[{rpc_endpoint, rest_endpoint, name, region, priority}]`
    EndpointList(Vec<Value>),
    /// `[{rpc, api}]`
    GenericList(Vec<Value>),
}

#[derive(Debug, Deserialize)]
struct RegistryEndpoint {
    address: String,
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointEntry {
    rpc_endpoint: String,
    rest_endpoint: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    priority: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenericEntry {
    rpc: String,
    api: String,
    #[serde(default, alias = "provider")]
    name: Option<String>,
}

impl SourcePayload {
    /// Match a JSON body against the known shapes, in order
    pub fn classify(value: Value) -> Result<Self> {
        if let Some(apis) = value.get("apis").and_then(Value::as_object) {
            let list = |key: &str| {
                apis.get(key)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
            };
            return Ok(Self::ChainRegistry {
                rpc: list("rpc"),
                rest: list("rest"),
            });
        }

        let entries = match value {
            Value::Array(entries) => entries,
            Value::Object(mut map) => match ["nodes", "endpoints", "data"]
                .iter()
                .find_map(|key| map.remove(*key).filter(Value::is_array))
            {
                Some(Value::Array(entries)) => entries,
                _ => return Err(Error::Parse("no endpoint list in response".to_string())),
            },
            _ => return Err(Error::Parse("response is neither an object nor a list".to_string())),
        };

        let has_key = |key: &str| entries.iter().any(|e| e.get(key).is_some());
        if has_key("rpc_endpoint") {
            Ok(Self::EndpointList(entries))
        } else if has_key("rpc") {
            Ok(Self::GenericList(entries))
        } else {
            Err(Error::Parse("unrecognised endpoint list shape".to_string()))
        }
    }
}

/// Parse a source response body into candidate nodes for `chain_id`
pub fn parse_candidates(
    body: &[u8],
    source: &DiscoverySourceConfig,
    chain_id: &str,
) -> Result<Vec<Node>> {
    let value: Value = serde_json::from_slice(body)?;
    let payload = SourcePayload::classify(value)?;
    Ok(candidates_from(payload, source, chain_id))
}

fn candidates_from(payload: SourcePayload, source: &DiscoverySourceConfig, chain_id: &str) -> Vec<Node> {
    let origin = NodeSource::Discovered {
        source: source.name.clone(),
    };
    let default_priority = DISCOVERED_PRIORITY_BASE.saturating_add(source.priority);
    let mut nodes = Vec::new();

    match payload {
        SourcePayload::ChainRegistry { rpc, rest } => {
            let rpc: Vec<RegistryEndpoint> = typed_entries(rpc, &source.name);
            let rest: Vec<RegistryEndpoint> = typed_entries(rest, &source.name);
            let mut used = HashSet::new();

            for (index, endpoint) in rpc.iter().enumerate() {
                let Some(rest_index) = pair_rest(endpoint, index, &rest, &used) else {
                    tracing::trace!(source = %source.name, rpc = %endpoint.address, "No REST pair for RPC endpoint");
                    continue;
                };
                used.insert(rest_index);

                let provider = endpoint.provider.clone().unwrap_or_else(|| host_of(&endpoint.address));
                if let Some(node) = candidate(
                    &source.name,
                    &provider,
                    &endpoint.address,
                    &rest[rest_index].address,
                    infer_region(&provider),
                    default_priority,
                    chain_id,
                ) {
                    nodes.push(node.with_source(origin.clone()));
                }
            }
        }
        SourcePayload::EndpointList(entries) => {
            for entry in typed_entries::<EndpointEntry>(entries, &source.name) {
                let name = entry.name.unwrap_or_else(|| host_of(&entry.rpc_endpoint));
                let region = entry
                    .region
                    .filter(|r| !r.trim().is_empty())
                    .map_or_else(|| infer_region(&name).to_string(), |r| r.to_lowercase());
                if let Some(node) = candidate(
                    &source.name,
                    &name,
                    &entry.rpc_endpoint,
                    &entry.rest_endpoint,
                    &region,
                    entry.priority.unwrap_or(default_priority),
                    chain_id,
                ) {
                    nodes.push(node.with_source(origin.clone()));
                }
            }
        }
        SourcePayload::GenericList(entries) => {
            for entry in typed_entries::<GenericEntry>(entries, &source.name) {
                let name = entry.name.unwrap_or_else(|| host_of(&entry.rpc));
                if let Some(node) = candidate(
                    &source.name,
                    &name,
                    &entry.rpc,
                    &entry.api,
                    infer_region(&name),
                    default_priority,
                    chain_id,
                ) {
                    nodes.push(node.with_source(origin.clone()));
                }
            }
        }
    }

    nodes
}

fn typed_entries<T: serde::de::DeserializeOwned>(entries: Vec<Value>, source: &str) -> Vec<T> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry) {
            Ok(typed) => Some(typed),
            Err(e) => {
                tracing::trace!(source = %source, error = %e, "Skipping malformed entry");
                None
            }
        })
        .collect()
}

/// REST partner for an RPC endpoint: same provider first, then same position
fn pair_rest(
    rpc: &RegistryEndpoint,
    index: usize,
    rest: &[RegistryEndpoint],
    used: &HashSet<usize>,
) -> Option<usize> {
    if let Some(provider) = rpc.provider.as_deref() {
        let by_provider = rest.iter().enumerate().position(|(i, r)| {
            !used.contains(&i)
                && r.provider
                    .as_deref()
                    .is_some_and(|p| p.eq_ignore_ascii_case(provider))
        });
        if by_provider.is_some() {
            return by_provider;
        }
    }
    (index < rest.len() && !used.contains(&index)).then_some(index)
}

fn candidate(
    source: &str,
    name: &str,
    rpc: &str,
    rest: &str,
    region: &str,
    priority: u32,
    chain_id: &str,
) -> Option<Node> {
    if !is_http_url(rpc) || !is_http_url(rest) {
        tracing::trace!(source = %source, rpc = %rpc, rest = %rest, "Skipping entry with invalid URL");
        return None;
    }

    let id = format!("{}-{}", slug(source), nanoid::nanoid!(8));
    Some(
        Node::new(id, name, rpc.trim_end_matches('/'), rest.trim_end_matches('/'), chain_id)
            .with_region(region)
            .with_priority(priority),
    )
}

fn is_http_url(address: &str) -> bool {
    url::Url::parse(address).is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
}

fn host_of(address: &str) -> String {
    url::Url::parse(address)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| address.to_string())
}

fn slug(text: &str) -> String {
    let slug: String = text
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    slug.trim_matches('-').to_string()
}

const US_HINTS: &[&str] = &[
    "us", "usa", "na", "america", "american", "canada", "virginia", "ohio", "oregon",
    "california", "texas", "chicago", "dallas", "newyork", "nyc",
];
const EU_HINTS: &[&str] = &[
    "eu", "europe", "european", "germany", "de", "france", "fr", "uk", "london", "frankfurt",
    "amsterdam", "netherlands", "nl", "paris", "finland", "helsinki", "poland", "warsaw",
];
const ASIA_HINTS: &[&str] = &[
    "asia", "ap", "apac", "singapore", "sg", "japan", "jp", "tokyo", "korea", "kr", "seoul",
    "hongkong", "hk", "india", "mumbai", "china", "taiwan", "vietnam",
];

/// Guess a region tag from free text such as a provider or node name
#[must_use]
pub fn infer_region(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    for (region, hints) in [("us", US_HINTS), ("eu", EU_HINTS), ("asia", ASIA_HINTS)] {
        if tokens.iter().any(|t| hints.contains(t)) {
            return region;
        }
    }
    "global"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> DiscoverySourceConfig {
        DiscoverySourceConfig {
            name: "Test Source".to_string(),
            url: "http://example.invalid/nodes".to_string(),
            priority: 2,
            active: true,
        }
    }

    #[test]
    fn test_chain_registry_pair() {
        let body = br#"{"apis":{"rpc":[{"address":"http://x:26657","provider":"p1"}],
                                 "rest":[{"address":"http://x:1317","provider":"p1"}]}}"#;
        let nodes = parse_candidates(body, &source(), "testchain-1").unwrap();

        assert_eq!(nodes.len(), 1);
        let node = &nodes[0];
        assert_eq!(node.rpc, "http://x:26657");
        assert_eq!(node.rest, "http://x:1317");
        assert_eq!(node.name, "p1");
        assert_eq!(node.region, "global");
        assert_eq!(node.chain_id, "testchain-1");
        assert_eq!(node.priority, DISCOVERED_PRIORITY_BASE + 2);
        assert!(node.id.starts_with("test-source-"));
        assert!(node.is_discovered());
    }

    #[test]
    fn test_chain_registry_pairs_by_provider_then_position() {
        let body = br#"{"apis":{
            "rpc":[{"address":"https://rpc.alpha.io","provider":"Alpha Europe"},
                   {"address":"https://rpc.beta.io","provider":"Beta"},
                   {"address":"https://rpc.gamma.io"}],
            "rest":[{"address":"https://rest.beta.io","provider":"beta"},
                    {"address":"https://rest.alpha.io","provider":"Alpha Europe"},
                    {"address":"https://rest.gamma.io"}]}}"#;
        let nodes = parse_candidates(body, &source(), "testchain-1").unwrap();

        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].rest, "https://rest.alpha.io");
        assert_eq!(nodes[0].region, "eu");
        assert_eq!(nodes[1].rest, "https://rest.beta.io");
        assert_eq!(nodes[2].rest, "https://rest.gamma.io");
        assert_eq!(nodes[2].name, "rpc.gamma.io");
    }

    #[test]
    fn test_endpoint_list() {
        let body = br#"{"nodes":[
            {"rpc_endpoint":"https://rpc.one.io","rest_endpoint":"https://api.one.io","name":"One","region":"ASIA","priority":4},
            {"rpc_endpoint":"https://rpc.two.io","rest_endpoint":"https://api.two.io"},
            {"rpc_endpoint":"https://rpc.bad.io"}
        ]}"#;
        let nodes = parse_candidates(body, &source(), "testchain-1").unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "One");
        assert_eq!(nodes[0].region, "asia");
        assert_eq!(nodes[0].priority, 4);
        assert_eq!(nodes[1].priority, DISCOVERED_PRIORITY_BASE + 2);
    }

    #[test]
    fn test_generic_list_skips_malformed_entries() {
        let body = br#"[
            {"rpc":"https://rpc.sg-node.io/","api":"https://api.sg-node.io","provider":"SG Node"},
            {"rpc":"ftp://rpc.weird.io","api":"https://api.weird.io"},
            {"rpc":42,"api":"https://api.num.io"},
            "garbage"
        ]"#;
        let nodes = parse_candidates(body, &source(), "testchain-1").unwrap();

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].rpc, "https://rpc.sg-node.io");
        assert_eq!(nodes[0].name, "SG Node");
        assert_eq!(nodes[0].region, "asia");
    }

    #[test]
    fn test_unknown_shapes_fail() {
        for body in [
            &br#"{"status":"ok"}"#[..],
            br#"[{"host":"x"}]"#,
            br#""just a string""#,
            b"not json",
        ] {
            assert!(parse_candidates(body, &source(), "testchain-1").is_err());
        }
    }

    #[test]
    fn test_infer_region() {
        assert_eq!(infer_region("Polkachu US-East"), "us");
        assert_eq!(infer_region("frankfurt-1"), "eu");
        assert_eq!(infer_region("Tokyo Validators"), "asia");
        assert_eq!(infer_region("p1"), "global");
        // substrings do not count
        assert_eq!(infer_region("Australis"), "global");
    }
}
