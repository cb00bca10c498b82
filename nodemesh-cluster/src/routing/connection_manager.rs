//! Connection binding on top of the request executor
//!
//! Long-lived clients (wallet signers, websocket sessions) hold a connection
//! object tied to one node. `ConnectionManager` remembers which node the
//! current connection is bound to and rebuilds it whenever the executor picks
//! a different node.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::executor::{ExecuteOptions, RequestExecutor};
use crate::discovery::Node;
use crate::error::Result;

/// Builds a client connection for a node
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send + Sync;

    async fn connect(&self, node: &Node) -> anyhow::Result<Self::Connection>;
}

struct Binding<C> {
    node_id: String,
    connection: Arc<C>,
}

pub struct ConnectionManager<K: Connector> {
    executor: Arc<RequestExecutor>,
    connector: K,
    bound: Mutex<Option<Binding<K::Connection>>>,
}

impl<K: Connector> ConnectionManager<K> {
    pub fn new(executor: Arc<RequestExecutor>, connector: K) -> Self {
        Self {
            executor,
            connector,
            bound: Mutex::new(None),
        }
    }

    /// Id of the node the current connection is bound to
    pub async fn bound_node(&self) -> Option<String> {
        self.bound.lock().await.as_ref().map(|b| b.node_id.clone())
    }

    /// Drop the current connection; the next call reconnects
    pub async fn disconnect(&self) {
        if let Some(binding) = self.bound.lock().await.take() {
            tracing::debug!(node_id = %binding.node_id, "Connection released");
        }
    }

    /// Connection for `node`, reusing the bound one when the node is unchanged
    async fn connection_for(&self, node: &Node) -> anyhow::Result<Arc<K::Connection>> {
        let mut bound = self.bound.lock().await;
        if let Some(binding) = bound.as_ref() {
            if binding.node_id == node.id {
                return Ok(Arc::clone(&binding.connection));
            }
        }

        let connection = Arc::new(self.connector.connect(node).await?);
        match bound.as_ref() {
            Some(previous) => {
                tracing::info!(from = %previous.node_id, to = %node.id, "Rebinding connection");
            }
            None => tracing::info!(node_id = %node.id, "Connection bound"),
        }
        *bound = Some(Binding {
            node_id: node.id.clone(),
            connection: Arc::clone(&connection),
        });
        Ok(connection)
    }

    pub async fn execute<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: Fn(Arc<K::Connection>, Node) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_with(self.executor.defaults(), request).await
    }

    /// Run `request` with a connection bound to the selected node.
    ///
    /// A failed connect counts as a failed attempt against that node.
    pub async fn execute_with<T, F, Fut>(&self, options: ExecuteOptions, request: F) -> Result<T>
    where
        F: Fn(Arc<K::Connection>, Node) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let request = &request;
        self.executor
            .execute_with(options, move |node| async move {
                let connection = self.connection_for(&node).await?;
                request(connection, node).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::probe::MockNodeProber;
    use crate::discovery::{CircuitBreaker, HealthMonitor, NodeRegistry, NodeSelector};
    use crate::routing::usage::UsageTracker;
    use nodemesh_core::{BreakerConfig, ExecutorConfig, HealthConfig, SelectionStrategy};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicU32,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Connection = String;

        async fn connect(&self, node: &Node) -> anyhow::Result<String> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if node.id == "broken" {
                anyhow::bail!("handshake rejected");
            }
            Ok(format!("session@{}", node.id))
        }
    }

    fn healthy(id: &str, priority: u32) -> Node {
        let mut node = Node::new(id, id, format!("http://{id}:26657"), format!("http://{id}:1317"), "testchain-1")
            .with_priority(priority);
        node.healthy = true;
        node
    }

    fn manager(nodes: Vec<Node>) -> (Arc<CircuitBreaker>, ConnectionManager<CountingConnector>) {
        let registry = Arc::new(NodeRegistry::with_nodes(nodes));
        let breaker = Arc::new(CircuitBreaker::new(&BreakerConfig::default()));
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            Arc::new(MockNodeProber::new()),
            "testchain-1",
            &HealthConfig::default(),
        ));
        let executor = RequestExecutor::new(
            registry,
            breaker.clone(),
            Arc::new(NodeSelector::new(SelectionStrategy::PriorityFirst)),
            monitor,
            Arc::new(UsageTracker::new()),
            "testchain-1",
            &ExecutorConfig::default(),
        )
        .with_fallback_nodes(Vec::new());

        (breaker, ConnectionManager::new(Arc::new(executor), CountingConnector::default()))
    }

    #[tokio::test]
    async fn test_reuses_connection_for_same_node() {
        let (_, manager) = manager(vec![healthy("a", 1), healthy("b", 2)]);

        for _ in 0..3 {
            let session = manager
                .execute(|conn, _| async move { Ok(conn.to_string()) })
                .await
                .unwrap();
            assert_eq!(session, "session@a");
        }
        assert_eq!(manager.connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.bound_node().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_rebinds_when_selection_changes() {
        let (breaker, manager) = manager(vec![healthy("a", 1), healthy("b", 2)]);
        manager.execute(|_, _| async { Ok(()) }).await.unwrap();

        for _ in 0..5 {
            breaker.record_failure("a");
        }

        let session = manager
            .execute(|conn, _| async move { Ok(conn.to_string()) })
            .await
            .unwrap();
        assert_eq!(session, "session@b");
        assert_eq!(manager.bound_node().await.as_deref(), Some("b"));
        assert_eq!(manager.connector.connects.load(Ordering::SeqCst), 2);

        manager.disconnect().await;
        assert!(manager.bound_node().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_a_failed_attempt() {
        let (breaker, manager) = manager(vec![healthy("broken", 1), healthy("b", 2)]);
        for _ in 0..4 {
            breaker.record_failure("broken");
        }

        let session = manager
            .execute(|conn, _| async move { Ok(conn.to_string()) })
            .await
            .unwrap();
        assert_eq!(session, "session@b");
        assert!(!breaker.is_available("broken"));
    }
}
