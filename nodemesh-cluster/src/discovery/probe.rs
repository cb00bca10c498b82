//! Node probes
//!
//! Two probes per node: a status probe against the RPC endpoint (liveness,
//! block height, latency) and a sync probe against the REST endpoint
//! (whether the node is still catching up).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tokio::time::Instant;

use super::node_registry::Node;
use crate::error::{Error, Result};

/// REST path reporting whether the node is syncing
pub const SYNCING_PATH: &str = "/cosmos/base/tendermint/v1beta1/syncing";

/// Result of a successful status probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusProbe {
    pub block_height: u64,
    pub catching_up: bool,
    pub response_time_ms: u64,
}

/// Probe seam used by the health monitor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeProber: Send + Sync {
    /// Liveness probe: online, latest height and latency
    async fn probe_status(&self, node: &Node) -> Result<StatusProbe>;

    /// Sync probe: `true` when the node is caught up with the network
    async fn probe_sync(&self, node: &Node) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SyncInfo {
    #[serde(deserialize_with = "de_height")]
    pub latest_block_height: u64,
    pub catching_up: bool,
}

#[derive(Debug, Deserialize)]
struct SyncInfoHolder {
    sync_info: SyncInfo,
}

/// Known status body shapes, tried in declaration order
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatusShape {
    /// `{"jsonrpc":"2.0","result":{"sync_info":{..}}}`
    JsonRpc { result: SyncInfoHolder },
    /// `{"sync_info":{..}}`
    Bare(SyncInfoHolder),
    /// `{"latest_block_height":"..","catching_up":false}`
    Flat(SyncInfo),
}

impl From<StatusShape> for SyncInfo {
    fn from(shape: StatusShape) -> Self {
        match shape {
            StatusShape::JsonRpc { result } => result.sync_info,
            StatusShape::Bare(holder) => holder.sync_info,
            StatusShape::Flat(info) => info,
        }
    }
}

/// Heights arrive as JSON strings from Tendermint and as numbers elsewhere
fn de_height<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Height {
        Num(u64),
        Str(String),
    }

    match Height::deserialize(deserializer)? {
        Height::Num(n) => Ok(n),
        Height::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Extract sync info from a status body. Any unknown shape is a parse error.
pub fn parse_status(body: &[u8]) -> Result<SyncInfo> {
    let shape: StatusShape = serde_json::from_slice(body)
        .map_err(|_| Error::Parse("unrecognised status response shape".to_string()))?;
    Ok(shape.into())
}

#[derive(Debug, Deserialize)]
struct SyncingResponse {
    syncing: bool,
}

/// HTTP prober backed by `reqwest`
///
/// `timeout` is the budget for one probe. The status probe spends at most
/// half of it on `/health` so the `/status` fallback always gets a turn.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: Client,
    timeout: Duration,
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new(nodemesh_core::timeouts::PROBE_TIMEOUT)
    }
}

impl HttpProber {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(timeout / 2)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build probe client, using defaults");
                Client::new()
            });
        Self { client, timeout }
    }

    async fn get_status(&self, url: &str, timeout: Duration) -> Result<SyncInfo> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;
        parse_status(&body)
    }
}

#[async_trait]
impl NodeProber for HttpProber {
    async fn probe_status(&self, node: &Node) -> Result<StatusProbe> {
        let base = node.rpc.trim_end_matches('/');

        let started = Instant::now();
        let info = match self.get_status(&format!("{base}/health"), self.timeout / 2).await {
            Ok(info) => info,
            Err(e) => {
                tracing::trace!(node_id = %node.id, error = %e, "/health unusable, trying /status");
                let remaining = self.timeout.saturating_sub(started.elapsed());
                self.get_status(&format!("{base}/status"), remaining).await?
            }
        };
        let elapsed = started.elapsed();

        Ok(StatusProbe {
            block_height: info.latest_block_height,
            catching_up: info.catching_up,
            response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        })
    }

    async fn probe_sync(&self, node: &Node) -> Result<bool> {
        let url = format!("{}{SYNCING_PATH}", node.rest.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        let body: SyncingResponse = serde_json::from_slice(&response.bytes().await?)?;
        Ok(!body.syncing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_jsonrpc_status() {
        let body = br#"{"jsonrpc":"2.0","id":-1,"result":{"node_info":{"network":"cosmoshub-4"},
            "sync_info":{"latest_block_height":"19000123","catching_up":false}}}"#;
        let info = parse_status(body).unwrap();
        assert_eq!(info.latest_block_height, 19_000_123);
        assert!(!info.catching_up);
    }

    #[test]
    fn test_parse_bare_status() {
        let body = br#"{"sync_info":{"latest_block_height":42,"catching_up":true}}"#;
        let info = parse_status(body).unwrap();
        assert_eq!(info.latest_block_height, 42);
        assert!(info.catching_up);
    }

    #[test]
    fn test_parse_flat_status() {
        let body = br#"{"latest_block_height":"7","catching_up":false,"extra":1}"#;
        assert_eq!(parse_status(body).unwrap().latest_block_height, 7);
    }

    #[test]
    fn test_unknown_shapes_are_parse_errors() {
        for body in [
            &br#"{"jsonrpc":"2.0","id":-1,"result":{}}"#[..],
            br#"{"height":"12"}"#,
            br#"{"sync_info":{"latest_block_height":"abc","catching_up":false}}"#,
            b"<html>502 Bad Gateway</html>",
        ] {
            assert!(matches!(parse_status(body), Err(Error::Parse(_))));
        }
    }

    fn node_for(server: &MockServer) -> Node {
        Node::new("n", "n", server.uri(), server.uri(), "testchain-1")
    }

    #[tokio::test]
    async fn test_status_falls_back_from_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": -1, "result": {}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {"sync_info": {"latest_block_height": "100", "catching_up": false}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let probe = HttpProber::default()
            .probe_status(&node_for(&server))
            .await
            .unwrap();
        assert_eq!(probe.block_height, 100);
        assert!(!probe.catching_up);
    }

    #[tokio::test]
    async fn test_status_fails_when_both_endpoints_fail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = HttpProber::default().probe_status(&node_for(&server)).await;
        assert!(matches!(result, Err(Error::Http(_))));
    }

    #[tokio::test]
    async fn test_sync_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SYNCING_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"syncing": true})))
            .mount(&server)
            .await;

        let caught_up = HttpProber::default()
            .probe_sync(&node_for(&server))
            .await
            .unwrap();
        assert!(!caught_up);
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let result = HttpProber::new(Duration::from_millis(50))
            .probe_sync(&node_for(&server))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_hanging_health_leaves_budget_for_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sync_info": {"latest_block_height": "55", "catching_up": false}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let timeout = Duration::from_millis(800);
        let probe = tokio::time::timeout(timeout, HttpProber::new(timeout).probe_status(&node_for(&server)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(probe.block_height, 55);
    }
}
