//! Health monitoring for mesh nodes
//!
//! Probes every registered node on a fixed interval, writes the results into
//! the registry and publishes a `HealthEvent` per node on a broadcast bus.

use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use nodemesh_core::HealthConfig;

use super::node_registry::{HealthCheckResult, Node, NodeRegistry};
use super::probe::NodeProber;

/// Default delay unit between connectivity test attempts
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Published after every registry health update
#[derive(Debug, Clone)]
pub struct HealthEvent {
    /// Node snapshot after the update
    pub node: Node,
    pub result: HealthCheckResult,
}

/// Health monitor for mesh nodes
///
/// The only writer of node health fields in the registry.
pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    prober: Arc<dyn NodeProber>,
    chain_id: String,
    check_interval: Duration,
    probe_timeout: Duration,
    retry_delay: Duration,
    events: broadcast::Sender<HealthEvent>,
    cancel_token: Mutex<CancellationToken>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        prober: Arc<dyn NodeProber>,
        chain_id: impl Into<String>,
        config: &HealthConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            registry,
            prober,
            chain_id: chain_id.into(),
            check_interval: config.interval(),
            probe_timeout: config.probe_timeout(),
            retry_delay: DEFAULT_RETRY_DELAY,
            events,
            cancel_token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Token for new background tasks, replacing one spent by `shutdown()`
    fn live_token(&self) -> CancellationToken {
        let mut token = self.cancel_token.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    /// Override the delay unit used by `test_connectivity` backoff
    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Run both probes against `node` without touching the registry.
    ///
    /// Failures never propagate; they come back as an unhealthy result with
    /// the error retained.
    pub async fn check_node(&self, node: &Node) -> HealthCheckResult {
        let timeout = self.probe_timeout;
        let (status, sync) = tokio::join!(
            tokio::time::timeout(timeout, self.prober.probe_status(node)),
            tokio::time::timeout(timeout, self.prober.probe_sync(node)),
        );

        let status = match status {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return HealthCheckResult::failed(format!("status probe: {e}")),
            Err(_) => return HealthCheckResult::failed(format!("status probe timed out after {timeout:?}")),
        };

        let mut result = HealthCheckResult::healthy(status.response_time_ms, status.block_height);
        match sync {
            Ok(Ok(synced)) => {
                result.caught_up = synced && !status.catching_up;
            }
            Ok(Err(e)) => {
                result.caught_up = false;
                result.error = Some(format!("sync probe: {e}"));
            }
            Err(_) => {
                result.caught_up = false;
                result.error = Some(format!("sync probe timed out after {timeout:?}"));
            }
        }
        result
    }

    /// Probe every node of the chain concurrently, then record and publish.
    ///
    /// The round completes only when every probe has settled.
    pub async fn check_all(&self) -> Vec<HealthEvent> {
        let nodes = self.registry.list_nodes(&self.chain_id);
        if nodes.is_empty() {
            tracing::debug!(chain_id = %self.chain_id, "No nodes to probe");
            return Vec::new();
        }

        let results =
            futures::future::join_all(nodes.iter().map(|node| self.check_node(node))).await;

        let events: Vec<HealthEvent> = nodes
            .iter()
            .zip(results)
            .filter_map(|(previous, result)| self.record(previous, result))
            .collect();

        let healthy = events.iter().filter(|e| e.node.healthy).count();
        tracing::debug!(
            chain_id = %self.chain_id,
            probed = events.len(),
            healthy = healthy,
            "Health check round complete"
        );

        events
    }

    /// Probe one registered node immediately and record the result
    pub async fn check_node_now(&self, node_id: &str) -> Option<HealthEvent> {
        let node = self.registry.get_node(node_id)?;
        let result = self.check_node(&node).await;
        self.record(&node, result)
    }

    fn record(&self, previous: &Node, result: HealthCheckResult) -> Option<HealthEvent> {
        // node may have been removed while the probe was in flight
        let node = self.registry.update_health(&previous.id, &result)?;

        if previous.healthy != node.healthy || previous.last_checked_at.is_none() {
            if node.healthy {
                tracing::info!(
                    node_id = %node.id,
                    response_time_ms = node.response_time_ms,
                    block_height = node.block_height,
                    "Node is healthy"
                );
            } else {
                tracing::warn!(
                    node_id = %node.id,
                    error = result.error.as_deref().unwrap_or("catching up"),
                    "Node is unhealthy"
                );
            }
        }

        let event = HealthEvent { node, result };
        // no subscribers is fine
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// Probe `node` up to `retries` times with linear backoff
    /// (`attempt * retry_delay`). Registry state is never touched.
    pub async fn test_connectivity(&self, node: &Node, retries: u32) -> bool {
        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            let result = self.check_node(node).await;
            if result.is_healthy() {
                return true;
            }
            tracing::debug!(
                node_id = %node.id,
                attempt = attempt,
                error = result.error.as_deref().unwrap_or("catching up"),
                "Connectivity test failed"
            );
            if attempt < attempts {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }
        false
    }

    /// Subscribe to health events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Register a callback invoked for every health event.
    ///
    /// Each observer runs on its own task, so a slow observer cannot delay
    /// the monitor and a panicking one only loses the event it panicked on.
    pub fn add_observer<F>(&self, observer: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&HealthEvent) + Send + Sync + 'static,
    {
        let mut rx = self.events.subscribe();
        let cancel_token = self.live_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => return,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            if std::panic::catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                                tracing::error!(node_id = %event.node.id, "Health observer panicked");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped = skipped, "Health observer lagging, events dropped");
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        })
    }

    /// Start the periodic health check loop.
    ///
    /// The first round runs immediately. Use `shutdown()` to stop it; a
    /// later `start()` spawns a fresh loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let cancel_token = self.live_token();
        let mut timer = interval(self.check_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            chain_id = %self.chain_id,
            interval_secs = self.check_interval.as_secs(),
            "Health monitor started"
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Health monitor shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        monitor.check_all().await;
                    }
                }
            }
        })
    }

    /// Gracefully shut down the monitoring loop and observers
    pub fn shutdown(&self) {
        self.cancel_token.lock().cancel();
    }
}
