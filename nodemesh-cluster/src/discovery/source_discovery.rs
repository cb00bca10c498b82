//! Node discovery from external node-list sources
//!
//! Periodically queries every active source, merges candidates into the
//! registry by RPC address, admits new nodes only after a connectivity test,
//! and prunes discovered nodes that stayed unhealthy for too long.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use nodemesh_core::{DiscoveryConfig, DiscoverySourceConfig};

use super::catalog;
use super::health_monitor::HealthMonitor;
use super::node_registry::{Node, NodeMetadata, NodeRegistry};
use super::sources::parse_candidates;
use crate::error::Result;

/// Outcome of querying one source
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResult {
    pub source: String,
    pub success: bool,
    pub nodes_found: usize,
    pub error: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Summary of one discovery round
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryRound {
    pub results: Vec<DiscoveryResult>,
    /// Ids of nodes admitted this round
    pub added: Vec<String>,
    /// Existing discovered nodes whose metadata was refreshed
    pub refreshed: usize,
    /// New candidates discarded after failing the connectivity test
    pub rejected: usize,
    /// Ids of stale discovered nodes removed
    pub pruned: Vec<String>,
}

type PruneHook = Box<dyn Fn(&str) + Send + Sync>;

/// Discovery service for one chain
pub struct DiscoveryService {
    registry: Arc<NodeRegistry>,
    monitor: Arc<HealthMonitor>,
    client: Client,
    chain_id: String,
    sources: Vec<DiscoverySourceConfig>,
    check_interval: Duration,
    max_unhealthy_age: Duration,
    last_round: RwLock<Option<DiscoveryRound>>,
    on_pruned: Option<PruneHook>,
    cancel_token: Mutex<CancellationToken>,
}

impl DiscoveryService {
    /// Create a discovery service. With no configured sources the built-in
    /// sources for `chain_id` are used.
    pub fn new(
        registry: Arc<NodeRegistry>,
        monitor: Arc<HealthMonitor>,
        chain_id: impl Into<String>,
        config: &DiscoveryConfig,
    ) -> Result<Self> {
        let chain_id = chain_id.into();
        let sources = if config.sources.is_empty() {
            catalog::default_sources(&chain_id)
        } else {
            config.sources.clone()
        };

        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            registry,
            monitor,
            client,
            chain_id,
            sources,
            check_interval: config.interval(),
            max_unhealthy_age: config.max_unhealthy_age(),
            last_round: RwLock::new(None),
            on_pruned: None,
            cancel_token: Mutex::new(CancellationToken::new()),
        })
    }

    /// Called with the id of every node pruned from the registry
    #[must_use]
    pub fn on_pruned<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_pruned = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn sources(&self) -> &[DiscoverySourceConfig] {
        &self.sources
    }

    /// Summary of the most recent round, if any ran
    pub fn last_round(&self) -> Option<DiscoveryRound> {
        self.last_round.read().clone()
    }

    /// Query one source. Failures are captured in the result, never raised.
    pub async fn fetch_source(&self, source: &DiscoverySourceConfig) -> (DiscoveryResult, Vec<Node>) {
        let fetched = async {
            let response = self.client.get(&source.url).send().await?.error_for_status()?;
            let body = response.bytes().await?;
            parse_candidates(&body, source, &self.chain_id)
        }
        .await;

        match fetched {
            Ok(nodes) => {
                tracing::debug!(source = %source.name, nodes_found = nodes.len(), "Discovery source fetched");
                (
                    DiscoveryResult {
                        source: source.name.clone(),
                        success: true,
                        nodes_found: nodes.len(),
                        error: None,
                        fetched_at: Utc::now(),
                    },
                    nodes,
                )
            }
            Err(e) => {
                tracing::warn!(source = %source.name, url = %source.url, error = %e, "Discovery source failed");
                (
                    DiscoveryResult {
                        source: source.name.clone(),
                        success: false,
                        nodes_found: 0,
                        error: Some(e.to_string()),
                        fetched_at: Utc::now(),
                    },
                    Vec::new(),
                )
            }
        }
    }

    /// Run one discovery round across all active sources
    pub async fn discover(&self) -> DiscoveryRound {
        let mut active: Vec<&DiscoverySourceConfig> = self.sources.iter().filter(|s| s.active).collect();
        active.sort_by_key(|s| s.priority);

        // sources are independent; one failing never cancels another
        let fetched = futures::future::join_all(active.iter().map(|s| self.fetch_source(s))).await;

        let mut round = DiscoveryRound::default();
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();

        for (result, candidates) in fetched {
            round.results.push(result);
            for candidate in candidates {
                if !seen.insert(candidate.rpc_key()) {
                    continue;
                }
                match self.registry.find_by_rpc(&candidate.rpc) {
                    Some(existing) if existing.is_discovered() => {
                        let changed = self.registry.refresh_metadata(
                            &existing.id,
                            NodeMetadata {
                                name: candidate.name,
                                rest: candidate.rest,
                                region: candidate.region,
                                priority: candidate.priority,
                                websocket: candidate.websocket,
                            },
                        );
                        if changed {
                            round.refreshed += 1;
                        }
                    }
                    // seed and custom nodes are never overwritten
                    Some(_) => {}
                    None => fresh.push(candidate),
                }
            }
        }

        let verdicts = futures::future::join_all(
            fresh.iter().map(|node| self.monitor.test_connectivity(node, 1)),
        )
        .await;

        for (node, reachable) in fresh.into_iter().zip(verdicts) {
            if !reachable {
                tracing::debug!(rpc = %node.rpc, "Discarding unreachable discovered node");
                round.rejected += 1;
                continue;
            }
            let id = node.id.clone();
            let rpc = node.rpc.clone();
            match self.registry.add_node(node) {
                Ok(()) => {
                    tracing::info!(node_id = %id, rpc = %rpc, "Discovered node admitted");
                    // the monitor records the first health snapshot
                    self.monitor.check_node_now(&id).await;
                    round.added.push(id);
                }
                Err(e) => {
                    tracing::debug!(rpc = %rpc, error = %e, "Discovered node raced an existing entry");
                }
            }
        }

        round.pruned = self
            .registry
            .prune_stale(self.max_unhealthy_age)
            .into_iter()
            .map(|n| {
                tracing::info!(node_id = %n.id, rpc = %n.rpc, "Pruned long-unhealthy discovered node");
                if let Some(hook) = &self.on_pruned {
                    hook(&n.id);
                }
                n.id
            })
            .collect();

        tracing::info!(
            chain_id = %self.chain_id,
            sources = round.results.len(),
            failed_sources = round.results.iter().filter(|r| !r.success).count(),
            added = round.added.len(),
            refreshed = round.refreshed,
            rejected = round.rejected,
            pruned = round.pruned.len(),
            "Discovery round complete"
        );

        *self.last_round.write() = Some(round.clone());
        round
    }

    /// Start the periodic discovery loop. The first round runs immediately.
    ///
    /// Can be called again after `shutdown()`.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let cancel_token = {
            let mut token = self.cancel_token.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };
        let mut timer = interval(self.check_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Discovery service shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        service.discover().await;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.lock().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::probe::{MockNodeProber, StatusProbe};
    use crate::discovery::NodeSource;
    use nodemesh_core::HealthConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reachable_prober(unreachable: &'static str) -> MockNodeProber {
        let mut prober = MockNodeProber::new();
        prober.expect_probe_status().returning(move |node| {
            if node.rpc.contains(unreachable) {
                Err(crate::Error::Http("refused".to_string()))
            } else {
                Ok(StatusProbe { block_height: 10, catching_up: false, response_time_ms: 5 })
            }
        });
        prober.expect_probe_sync().returning(|_| Ok(true));
        prober
    }

    async fn service(
        server: &MockServer,
        registry: Arc<NodeRegistry>,
        prober: MockNodeProber,
    ) -> DiscoveryService {
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            Arc::new(prober),
            "testchain-1",
            &HealthConfig::default(),
        ));
        let config = DiscoveryConfig {
            sources: vec![
                DiscoverySourceConfig {
                    name: "registry".to_string(),
                    url: format!("{}/registry.json", server.uri()),
                    priority: 1,
                    active: true,
                },
                DiscoverySourceConfig {
                    name: "broken".to_string(),
                    url: format!("{}/broken.json", server.uri()),
                    priority: 2,
                    active: true,
                },
                DiscoverySourceConfig {
                    name: "disabled".to_string(),
                    url: format!("{}/disabled.json", server.uri()),
                    priority: 3,
                    active: false,
                },
            ],
            ..DiscoveryConfig::default()
        };
        DiscoveryService::new(registry, monitor, "testchain-1", &config).unwrap()
    }

    async fn mount_sources(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/registry.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "apis": {
                    "rpc": [
                        {"address": "http://x:26657", "provider": "p1"},
                        {"address": "http://dead:26657", "provider": "p2"},
                        {"address": "http://seed:26657", "provider": "p3"}
                    ],
                    "rest": [
                        {"address": "http://x:1317", "provider": "p1"},
                        {"address": "http://dead:1317", "provider": "p2"},
                        {"address": "http://seed:1317", "provider": "p3"}
                    ]
                }
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/disabled.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(0)
            .mount(server)
            .await;
    }

    fn seeded_registry() -> Arc<NodeRegistry> {
        Arc::new(NodeRegistry::with_nodes([Node::new(
            "seed",
            "Seed",
            "http://seed:26657",
            "http://seed:1317",
            "testchain-1",
        )
        .with_source(NodeSource::Seed)]))
    }

    #[tokio::test]
    async fn test_discover_admits_only_reachable_new_nodes() {
        let server = MockServer::start().await;
        mount_sources(&server).await;
        let registry = seeded_registry();
        let service = service(&server, registry.clone(), reachable_prober("dead")).await;

        let round = service.discover().await;

        assert_eq!(round.results.len(), 2);
        assert!(round.results[0].success);
        assert_eq!(round.results[0].nodes_found, 3);
        assert!(!round.results[1].success);
        assert!(round.results[1].error.is_some());

        assert_eq!(round.added.len(), 1);
        assert_eq!(round.rejected, 1);
        assert_eq!(registry.len(), 2);

        let admitted = registry.find_by_rpc("http://x:26657").unwrap();
        assert_eq!(admitted.rest, "http://x:1317");
        assert!(admitted.healthy);
        assert!(registry.find_by_rpc("http://dead:26657").is_none());
        // the seed entry keeps its identity and source
        assert_eq!(registry.find_by_rpc("http://seed:26657").unwrap().source, NodeSource::Seed);
    }

    #[tokio::test]
    async fn test_discover_twice_creates_no_duplicates() {
        let server = MockServer::start().await;
        mount_sources(&server).await;
        let registry = seeded_registry();
        let service = service(&server, registry.clone(), reachable_prober("dead")).await;

        service.discover().await;
        let first_id = registry.find_by_rpc("http://x:26657").unwrap().id;

        let round = service.discover().await;
        assert!(round.added.is_empty());
        assert_eq!(round.refreshed, 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_by_rpc("http://x:26657").unwrap().id, first_id);
        assert!(service.last_round().is_some());
    }

    #[tokio::test]
    async fn test_unparseable_source_is_a_failed_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;
        let registry = seeded_registry();
        let service = service(&server, registry, reachable_prober("dead")).await;

        let source = service.sources()[0].clone();
        let (result, nodes) = service.fetch_source(&source).await;
        assert!(!result.success);
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_pruned_nodes_are_reported() {
        let server = MockServer::start().await;
        mount_sources(&server).await;

        let mut stale = Node::new("old", "Old", "http://old:26657", "http://old:1317", "testchain-1").with_source(
            NodeSource::Discovered {
                source: "registry".to_string(),
            },
        );
        stale.discovered_at = Utc::now() - chrono::Duration::hours(48);
        let registry = Arc::new(NodeRegistry::with_nodes([stale]));

        let forgotten = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = forgotten.clone();
        let service = service(&server, registry.clone(), reachable_prober("dead"))
            .await
            .on_pruned(move |id| sink.lock().unwrap().push(id.to_string()));

        let round = service.discover().await;
        assert_eq!(round.pruned, vec!["old"]);
        assert_eq!(*forgotten.lock().unwrap(), vec!["old"]);
        assert!(!registry.contains("old"));
    }

    async fn wait_for_requests(server: &MockServer, at_least: usize) -> usize {
        for _ in 0..200 {
            let seen = server.received_requests().await.map_or(0, |r| r.len());
            if seen >= at_least {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("expected at least {at_least} discovery requests");
    }

    #[tokio::test]
    async fn test_loop_repeats_and_restarts_after_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let registry = seeded_registry();
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            Arc::new(reachable_prober("dead")),
            "testchain-1",
            &HealthConfig::default(),
        ));
        let config = DiscoveryConfig {
            interval_secs: 1,
            sources: vec![DiscoverySourceConfig {
                name: "flaky".to_string(),
                url: format!("{}/nodes.json", server.uri()),
                priority: 1,
                active: true,
            }],
            ..DiscoveryConfig::default()
        };
        let service = Arc::new(DiscoveryService::new(registry, monitor, "testchain-1", &config).unwrap());

        let handle = service.start();
        wait_for_requests(&server, 1).await;
        wait_for_requests(&server, 2).await;
        service.shutdown();
        handle.await.unwrap();

        let stopped_at = server.received_requests().await.map_or(0, |r| r.len());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(server.received_requests().await.map_or(0, |r| r.len()), stopped_at);
        assert!(!service.last_round().unwrap().results[0].success);

        let handle = service.start();
        wait_for_requests(&server, stopped_at + 1).await;
        service.shutdown();
        handle.await.unwrap();
    }
}
