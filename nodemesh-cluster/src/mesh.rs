//! Node mesh service
//!
//! Single entry point for callers. Wires the registry, health monitor,
//! circuit breaker, selector, discovery service and request executor for one
//! chain, and owns their background tasks.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use nodemesh_core::{Config, CustomNodeConfig, SelectionStrategy};

use crate::discovery::catalog;
use crate::discovery::load_balancer::is_eligible;
use crate::discovery::{
    CircuitBreaker, CircuitState, DiscoveryRound, DiscoveryService, HealthCheckResult, HealthEvent,
    HealthMonitor, HttpProber, Node, NodeProber, NodeRegistry, NodeSelector, NodeSource,
};
use crate::error::{Error, Result};
use crate::routing::{ConnectionManager, Connector, ExecuteOptions, RequestExecutor, UsageTracker};

/// Per-node view for stats output
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub id: String,
    pub name: String,
    pub rpc: String,
    pub region: String,
    pub priority: u32,
    pub source: NodeSource,
    pub healthy: bool,
    pub eligible: bool,
    pub response_time_ms: u64,
    pub block_height: u64,
    pub last_error: Option<String>,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub requests: u64,
    pub failures: u64,
    pub last_used: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub chain_id: String,
    pub strategy: SelectionStrategy,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub eligible_nodes: usize,
    /// Mean latency over healthy nodes, zero when none are healthy
    pub average_response_time_ms: u64,
    pub forced_node: Option<String>,
    pub per_node: Vec<NodeStats>,
    pub last_discovery: Option<DiscoveryRound>,
}

pub struct NodeMesh {
    config: Config,
    registry: Arc<NodeRegistry>,
    breaker: Arc<CircuitBreaker>,
    selector: Arc<NodeSelector>,
    monitor: Arc<HealthMonitor>,
    usage: Arc<UsageTracker>,
    executor: Arc<RequestExecutor>,
    discovery: Option<Arc<DiscoveryService>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeMesh {
    /// Build a mesh probing nodes over HTTP
    pub fn new(config: Config) -> Result<Self> {
        let prober = Arc::new(HttpProber::new(config.health.probe_timeout()));
        Self::with_prober(config, prober)
    }

    /// Build a mesh with a custom prober
    pub fn with_prober(config: Config, prober: Arc<dyn NodeProber>) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Configuration(errors.join("; ")))?;

        let chain_id = config.network.chain_id.clone();

        let mut initial = Vec::new();
        if config.network.use_seed_catalog {
            initial.extend(catalog::seed_nodes(&chain_id));
        }
        initial.extend(
            config
                .network
                .custom_nodes
                .iter()
                .map(|custom| custom_node(custom, &chain_id)),
        );

        let registry = Arc::new(NodeRegistry::with_nodes(initial));
        let breaker = Arc::new(CircuitBreaker::new(&config.breaker));
        let selector = Arc::new(NodeSelector::new(config.selection.strategy));
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            prober,
            chain_id.clone(),
            &config.health,
        ));
        let usage = Arc::new(UsageTracker::new());
        let executor = Arc::new(RequestExecutor::new(
            registry.clone(),
            breaker.clone(),
            selector.clone(),
            monitor.clone(),
            usage.clone(),
            chain_id.clone(),
            &config.executor,
        ));
        let discovery = if config.discovery.enabled {
            let (breaker, usage, executor) = (breaker.clone(), usage.clone(), executor.clone());
            let service = DiscoveryService::new(registry.clone(), monitor.clone(), chain_id.clone(), &config.discovery)?
                .on_pruned(move |node_id| forget_node(&breaker, &usage, &executor, node_id));
            Some(Arc::new(service))
        } else {
            None
        };

        tracing::info!(
            chain_id = %chain_id,
            nodes = registry.len(),
            strategy = %selector.strategy(),
            discovery = discovery.is_some(),
            "Node mesh initialized"
        );

        Ok(Self {
            config,
            registry,
            breaker,
            selector,
            monitor,
            usage,
            executor,
            discovery,
            tasks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn chain_id(&self) -> &str {
        &self.config.network.chain_id
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Start background health monitoring and discovery.
    ///
    /// With health monitoring disabled a single probe round still runs so
    /// nodes can become eligible. Can be called again after `shutdown()`.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            tracing::debug!("Node mesh already started");
            return;
        }
        if self.config.health.enabled {
            tasks.push(self.monitor.start());
        } else {
            let monitor = self.monitor.clone();
            tasks.push(tokio::spawn(async move {
                monitor.check_all().await;
                tracing::info!("Health monitoring disabled, initial probe round done");
            }));
        }
        if let Some(discovery) = &self.discovery {
            tasks.push(discovery.start());
        }
    }

    /// Stop background loops and wait for them to finish
    pub async fn shutdown(&self) {
        self.monitor.shutdown();
        if let Some(discovery) = &self.discovery {
            discovery.shutdown();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!(chain_id = %self.chain_id(), "Node mesh stopped");
    }

    pub async fn execute<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: FnMut(Node) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.executor.execute(request).await
    }

    pub async fn execute_with<T, F, Fut>(&self, options: ExecuteOptions, request: F) -> Result<T>
    where
        F: FnMut(Node) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.executor.execute_with(options, request).await
    }

    /// Connection manager sharing this mesh's executor
    pub fn connection_manager<K: Connector>(&self, connector: K) -> ConnectionManager<K> {
        ConnectionManager::new(self.executor.clone(), connector)
    }

    /// Node the next request would go to, if any is eligible
    pub fn get_best_node(&self) -> Option<Node> {
        self.executor.select_node()
    }

    pub fn get_network_stats(&self) -> NetworkStats {
        let nodes = self.registry.list_nodes(self.chain_id());

        let healthy: Vec<&Node> = nodes.iter().filter(|n| n.healthy).collect();
        let average_response_time_ms = if healthy.is_empty() {
            0
        } else {
            healthy.iter().map(|n| n.response_time_ms).sum::<u64>() / healthy.len() as u64
        };

        let per_node: Vec<NodeStats> = nodes
            .iter()
            .map(|node| {
                let breaker = self.breaker.snapshot(&node.id);
                let usage = self.usage.get(&node.id);
                NodeStats {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    rpc: node.rpc.clone(),
                    region: node.region.clone(),
                    priority: node.priority,
                    source: node.source.clone(),
                    healthy: node.healthy,
                    eligible: is_eligible(node, &self.breaker),
                    response_time_ms: node.response_time_ms,
                    block_height: node.block_height,
                    last_error: node.last_error.clone(),
                    circuit: breaker.state,
                    consecutive_failures: breaker.consecutive_failures,
                    requests: usage.requests,
                    failures: usage.failures,
                    last_used: usage.last_used,
                }
            })
            .collect();

        NetworkStats {
            chain_id: self.chain_id().to_string(),
            strategy: self.selector.strategy(),
            total_nodes: nodes.len(),
            healthy_nodes: healthy.len(),
            eligible_nodes: per_node.iter().filter(|n| n.eligible).count(),
            average_response_time_ms,
            forced_node: self.executor.forced_node(),
            per_node,
            last_discovery: self.discovery.as_ref().and_then(|d| d.last_round()),
        }
    }

    pub fn selection_strategy(&self) -> SelectionStrategy {
        self.selector.strategy()
    }

    pub fn set_selection_strategy(&self, strategy: SelectionStrategy) {
        self.selector.set_strategy(strategy);
    }

    /// Register an operator-supplied node and probe it right away
    pub async fn add_custom_node(&self, node: Node) -> Result<()> {
        if node.chain_id != self.chain_id() {
            return Err(Error::Configuration(format!(
                "node {} serves {}, mesh serves {}",
                node.id,
                node.chain_id,
                self.chain_id()
            )));
        }
        let node = node.with_source(NodeSource::Custom);
        let id = node.id.clone();
        self.registry.add_node(node)?;
        tracing::info!(node_id = %id, "Custom node added");
        self.monitor.check_node_now(&id).await;
        Ok(())
    }

    /// Remove a node and forget its breaker and usage state
    pub fn remove_node(&self, node_id: &str) -> bool {
        if self.registry.remove_node(node_id).is_none() {
            return false;
        }
        forget_node(&self.breaker, &self.usage, &self.executor, node_id);
        tracing::info!(node_id = %node_id, "Node removed from mesh");
        true
    }

    pub fn force_node(&self, node_id: &str) -> bool {
        self.executor.force_node(node_id)
    }

    pub fn clear_forced_node(&self) {
        self.executor.clear_forced_node();
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.registry.list_nodes(self.chain_id())
    }

    pub fn circuit_state(&self, node_id: &str) -> CircuitState {
        self.breaker.state(node_id)
    }

    /// Run one health round now
    pub async fn check_health(&self) -> Vec<HealthEvent> {
        self.monitor.check_all().await
    }

    /// One probe round against `node`; the registry is not touched
    pub async fn probe_node(&self, node: &Node) -> HealthCheckResult {
        self.monitor.check_node(node).await
    }

    /// Probe a node that need not be registered
    pub async fn test_connectivity(&self, node: &Node, retries: u32) -> bool {
        self.monitor.test_connectivity(node, retries).await
    }

    /// Run one discovery round now. `None` when discovery is disabled.
    pub async fn run_discovery(&self) -> Option<DiscoveryRound> {
        match &self.discovery {
            Some(discovery) => Some(discovery.discover().await),
            None => None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.monitor.subscribe()
    }

    pub fn add_observer<F>(&self, observer: F) -> JoinHandle<()>
    where
        F: Fn(&HealthEvent) + Send + Sync + 'static,
    {
        self.monitor.add_observer(observer)
    }
}

/// Drop the side-table state kept for a node that left the registry
fn forget_node(breaker: &CircuitBreaker, usage: &UsageTracker, executor: &RequestExecutor, node_id: &str) {
    breaker.reset(node_id);
    usage.remove(node_id);
    if executor.forced_node().as_deref() == Some(node_id) {
        executor.clear_forced_node();
    }
}

fn custom_node(custom: &CustomNodeConfig, chain_id: &str) -> Node {
    let name = if custom.name.is_empty() { &custom.id } else { &custom.name };
    let node = Node::new(&custom.id, name, &custom.rpc, &custom.rest, chain_id)
        .with_region(&custom.region)
        .with_priority(custom.priority)
        .with_source(NodeSource::Custom);
    match &custom.websocket {
        Some(ws) => node.with_websocket(ws),
        None => node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::probe::MockNodeProber;

    fn config() -> Config {
        let mut config = Config::default();
        config.network.chain_id = "testchain-1".to_string();
        config.network.use_seed_catalog = false;
        config.network.custom_nodes = vec![CustomNodeConfig {
            id: "local".to_string(),
            name: String::new(),
            rpc: "http://127.0.0.1:26657".to_string(),
            rest: "http://127.0.0.1:1317".to_string(),
            websocket: Some("ws://127.0.0.1:26657/websocket".to_string()),
            region: "eu".to_string(),
            priority: 1,
        }];
        config.discovery.enabled = false;
        config
    }

    #[test]
    fn test_builds_registry_from_config() {
        let mesh = NodeMesh::with_prober(config(), Arc::new(MockNodeProber::new())).unwrap();

        let nodes = mesh.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "local");
        assert_eq!(nodes[0].region, "eu");
        assert!(nodes[0].websocket.is_some());
        assert!(mesh.get_best_node().is_none());

        let stats = mesh.get_network_stats();
        assert_eq!(stats.total_nodes, 1);
        assert_eq!(stats.healthy_nodes, 0);
        assert_eq!(stats.average_response_time_ms, 0);
        assert!(stats.last_discovery.is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.breaker.failure_threshold = 0;
        let result = NodeMesh::with_prober(config, Arc::new(MockNodeProber::new()));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_seed_catalog_loaded_for_known_chain() {
        let mut config = Config::default();
        config.discovery.enabled = false;
        let mesh = NodeMesh::with_prober(config, Arc::new(MockNodeProber::new())).unwrap();
        assert!(mesh.nodes().iter().all(|n| n.source == NodeSource::Seed));
        assert!(!mesh.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_remove_node_clears_state() {
        let mesh = NodeMesh::with_prober(config(), Arc::new(MockNodeProber::new())).unwrap();
        assert!(mesh.force_node("local"));
        mesh.breaker.record_failure("local");

        assert!(mesh.remove_node("local"));
        assert!(!mesh.remove_node("local"));
        assert!(mesh.get_network_stats().forced_node.is_none());
        assert_eq!(mesh.breaker.snapshot("local").consecutive_failures, 0);
        assert!(mesh.run_discovery().await.is_none());
    }

    #[tokio::test]
    async fn test_pruned_nodes_lose_breaker_and_usage() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut config = config();
        config.discovery.enabled = true;
        config.discovery.sources = vec![nodemesh_core::DiscoverySourceConfig {
            name: "registry".to_string(),
            url: format!("{}/nodes.json", server.uri()),
            priority: 1,
            active: true,
        }];
        let mesh = NodeMesh::with_prober(config, Arc::new(MockNodeProber::new())).unwrap();

        let mut stale = Node::new("old", "Old", "http://old:26657", "http://old:1317", "testchain-1")
            .with_source(NodeSource::Discovered {
                source: "registry".to_string(),
            });
        stale.discovered_at = chrono::Utc::now() - chrono::Duration::hours(48);
        mesh.registry.add_node(stale).unwrap();
        mesh.breaker.record_failure("old");
        mesh.usage.record_request("old");
        assert!(mesh.force_node("old"));

        let round = mesh.run_discovery().await.unwrap();
        assert_eq!(round.pruned, vec!["old"]);
        assert!(mesh.breaker.all_snapshots().is_empty());
        assert_eq!(mesh.usage.get("old").requests, 0);
        assert!(mesh.executor.forced_node().is_none());
    }
}
