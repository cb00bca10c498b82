//! Request execution with node selection, retries and failover
//!
//! Each `execute` call runs its attempts strictly in sequence. Every attempt
//! picks the best eligible node, falls back to the public fallback list only
//! when nothing is eligible, and feeds the outcome into the circuit breaker
//! and usage counters. Callers see either a value or one aggregated error.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nodemesh_core::ExecutorConfig;

use super::usage::UsageTracker;
use crate::discovery::catalog;
use crate::discovery::load_balancer::eligible_nodes;
use crate::discovery::{CircuitBreaker, CircuitState, HealthMonitor, Node, NodeRegistry, NodeSelector};
use crate::error::{Error, Result};

/// Per-call overrides for `RequestExecutor::execute_with`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Maximum number of attempts; zero is treated as one
    pub max_retries: u32,
    /// Bound for a single attempt
    pub request_timeout: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout: nodemesh_core::timeouts::REQUEST_TIMEOUT,
        }
    }
}

impl From<&ExecutorConfig> for ExecuteOptions {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            request_timeout: config.request_timeout(),
        }
    }
}

/// The node serving one attempt
#[derive(Debug, Clone)]
struct Target {
    node: Node,
    fallback: bool,
}

pub struct RequestExecutor {
    registry: Arc<NodeRegistry>,
    breaker: Arc<CircuitBreaker>,
    selector: Arc<NodeSelector>,
    monitor: Arc<HealthMonitor>,
    usage: Arc<UsageTracker>,
    chain_id: String,
    defaults: ExecuteOptions,
    retry_base_delay: Duration,
    fallback_nodes: Vec<Node>,
    fallback_probe_retries: u32,
    forced_node: RwLock<Option<String>>,
}

impl RequestExecutor {
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        breaker: Arc<CircuitBreaker>,
        selector: Arc<NodeSelector>,
        monitor: Arc<HealthMonitor>,
        usage: Arc<UsageTracker>,
        chain_id: impl Into<String>,
        config: &ExecutorConfig,
    ) -> Self {
        let chain_id = chain_id.into();
        let fallback_nodes = if config.fallback_enabled {
            catalog::fallback_nodes(&chain_id)
        } else {
            Vec::new()
        };

        Self {
            registry,
            breaker,
            selector,
            monitor,
            usage,
            chain_id,
            defaults: ExecuteOptions::from(config),
            retry_base_delay: config.retry_base_delay(),
            fallback_nodes,
            fallback_probe_retries: config.fallback_probe_retries,
            forced_node: RwLock::new(None),
        }
    }

    /// Replace the fallback list. An empty list disables the fallback path.
    #[must_use]
    pub fn with_fallback_nodes(mut self, nodes: Vec<Node>) -> Self {
        self.fallback_nodes = nodes;
        self
    }

    #[must_use]
    pub const fn defaults(&self) -> ExecuteOptions {
        self.defaults
    }

    /// Pin routing to `node_id` while it stays eligible.
    ///
    /// Returns `false` if the node is not registered.
    pub fn force_node(&self, node_id: &str) -> bool {
        if !self.registry.contains(node_id) {
            return false;
        }
        *self.forced_node.write() = Some(node_id.to_string());
        tracing::info!(node_id = %node_id, "Routing pinned to node");
        true
    }

    pub fn clear_forced_node(&self) {
        if let Some(previous) = self.forced_node.write().take() {
            tracing::info!(node_id = %previous, "Routing pin cleared");
        }
    }

    pub fn forced_node(&self) -> Option<String> {
        self.forced_node.read().clone()
    }

    /// The node the next attempt would use, without touching the fallback list
    pub fn select_node(&self) -> Option<Node> {
        let eligible = eligible_nodes(self.registry.list_nodes(&self.chain_id), &self.breaker);

        let forced = self.forced_node.read().clone();
        if let Some(forced) = forced {
            match eligible.iter().find(|n| n.id == forced) {
                Some(node) => return Some(node.clone()),
                None => {
                    tracing::debug!(node_id = %forced, "Pinned node not eligible, using strategy");
                }
            }
        }

        self.selector.select(&eligible)
    }

    /// First reachable fallback node, tried in order
    async fn fallback_node(&self) -> Option<Node> {
        for node in &self.fallback_nodes {
            if self.monitor.test_connectivity(node, self.fallback_probe_retries).await {
                tracing::warn!(node_id = %node.id, rpc = %node.rpc, "No eligible node, using fallback");
                return Some(node.clone());
            }
        }
        None
    }

    async fn resolve_target(&self) -> Option<Target> {
        // a HalfOpen trial taken by a concurrent caller between selection
        // and claim drops that node out of the next selection
        for _ in 0..=self.registry.len() {
            let Some(node) = self.select_node() else {
                break;
            };
            if self.breaker.try_acquire(&node.id) {
                return Some(Target { node, fallback: false });
            }
        }
        self.fallback_node()
            .await
            .map(|node| Target { node, fallback: true })
    }

    /// Run `request` with the configured defaults
    pub async fn execute<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: FnMut(Node) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_with(self.defaults, request).await
    }

    /// Run `request` against the best node, retrying on failure.
    ///
    /// `request` is invoked at most `options.max_retries` times and never
    /// again after it succeeds. Attempt `n` is followed by a pause of
    /// `n * retry_base_delay` before the next one.
    pub async fn execute_with<T, F, Fut>(&self, options: ExecuteOptions, mut request: F) -> Result<T>
    where
        F: FnMut(Node) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = options.max_retries.max(1);
        let mut last_error = None;
        let mut reached_node = false;

        for attempt in 1..=max_attempts {
            match self.resolve_target().await {
                None => {
                    tracing::warn!(chain_id = %self.chain_id, attempt = attempt, "No eligible node");
                    last_error = Some(Error::NoEligibleNode(self.chain_id.clone()).to_string());
                }
                Some(Target { node, fallback }) => {
                    reached_node = true;
                    self.usage.record_request(&node.id);

                    let error = match tokio::time::timeout(options.request_timeout, request(node.clone())).await {
                        Ok(Ok(value)) => {
                            if !fallback {
                                self.breaker.record_success(&node.id);
                            }
                            return Ok(value);
                        }
                        Ok(Err(e)) => format!("{e:#}"),
                        Err(_) => format!("request timed out after {:?}", options.request_timeout),
                    };

                    // fallback nodes are one-off and carry no breaker state
                    if !fallback && self.breaker.record_failure(&node.id) == CircuitState::Open {
                        tracing::debug!(node_id = %node.id, "Node taken out of rotation");
                    }
                    self.usage.record_failure(&node.id);

                    tracing::warn!(
                        node_id = %node.id,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %error,
                        "Request attempt failed"
                    );
                    last_error = Some(error);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.retry_base_delay * attempt).await;
            }
        }

        if !reached_node {
            return Err(Error::NoEligibleNode(self.chain_id.clone()));
        }

        Err(Error::RetriesExhausted {
            attempts: max_attempts,
            last_error: last_error.unwrap_or_default(),
        })
    }
}
