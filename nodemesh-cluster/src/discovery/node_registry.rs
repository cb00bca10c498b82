//! Node registry for the blockchain endpoint pool
//!
//! Single source of truth for node identity and the latest health snapshot.
//! Readers always receive clones, so the only way to change a node is through
//! the mutators here.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Where a node entry came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeSource {
    /// Built-in seed catalog
    Seed,
    /// Added by an operator
    Custom,
    /// Found by a discovery source
    Discovered { source: String },
    /// One-off public fallback node, never stored in the registry
    Fallback,
}

/// One addressable network endpoint plus its health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub rpc: String,
    pub rest: String,
    pub websocket: Option<String>,
    pub region: String,
    /// Lower is preferred
    pub priority: u32,
    pub chain_id: String,
    pub version: Option<String>,
    pub is_validator: Option<bool>,
    pub source: NodeSource,
    pub discovered_at: DateTime<Utc>,

    // Health snapshot, written only through `NodeRegistry::update_health`
    pub healthy: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub response_time_ms: u64,
    pub block_height: u64,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Node {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        rpc: impl Into<String>,
        rest: impl Into<String>,
        chain_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rpc: rpc.into(),
            rest: rest.into(),
            websocket: None,
            region: "global".to_string(),
            priority: 0,
            chain_id: chain_id.into(),
            version: None,
            is_validator: None,
            source: NodeSource::Custom,
            discovered_at: Utc::now(),
            healthy: false,
            last_checked_at: None,
            response_time_ms: 0,
            block_height: 0,
            last_healthy_at: None,
            last_error: None,
        }
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_websocket(mut self, websocket: impl Into<String>) -> Self {
        self.websocket = Some(websocket.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: NodeSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub const fn with_validator(mut self, is_validator: bool) -> Self {
        self.is_validator = Some(is_validator);
        self
    }

    #[must_use]
    pub const fn is_discovered(&self) -> bool {
        matches!(self.source, NodeSource::Discovered { .. })
    }

    /// A discovered node that has not been healthy for longer than `max_age`.
    ///
    /// Age is measured from the last healthy check, or from discovery time
    /// when the node was never healthy.
    #[must_use]
    pub fn is_stale(&self, max_age: Duration) -> bool {
        if !self.is_discovered() || self.healthy {
            return false;
        }
        let since = self.last_healthy_at.unwrap_or(self.discovered_at);
        let elapsed = Utc::now().signed_duration_since(since);
        elapsed.to_std().is_ok_and(|elapsed| elapsed > max_age)
    }

    /// Normalized RPC address used for deduplication
    #[must_use]
    pub fn rpc_key(&self) -> String {
        normalize_address(&self.rpc)
    }
}

/// Lowercase and strip trailing slashes so equivalent URLs compare equal
#[must_use]
pub fn normalize_address(address: &str) -> String {
    address.trim().trim_end_matches('/').to_lowercase()
}

/// Outcome of one health probe round against one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub online: bool,
    pub response_time_ms: u64,
    pub block_height: u64,
    pub caught_up: bool,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    #[must_use]
    pub fn healthy(response_time_ms: u64, block_height: u64) -> Self {
        Self {
            online: true,
            response_time_ms,
            block_height,
            caught_up: true,
            error: None,
            checked_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            online: false,
            response_time_ms: 0,
            block_height: 0,
            caught_up: false,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }

    /// Both probes succeeded and the node is not catching up
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.online && self.caught_up && self.error.is_none()
    }
}

/// Display metadata a discovery merge may refresh on an existing node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetadata {
    pub name: String,
    pub rest: String,
    pub region: String,
    pub priority: u32,
    pub websocket: Option<String>,
}

/// In-memory node registry
///
/// Read-mostly: selection takes short read locks, health updates take a
/// short write lock per node. Insertion order is preserved.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<IndexMap<String, Node>>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with `nodes`, skipping duplicates
    #[must_use]
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let registry = Self::new();
        for node in nodes {
            if let Err(e) = registry.add_node(node) {
                tracing::warn!(error = %e, "Skipping duplicate node");
            }
        }
        registry
    }

    /// All nodes serving `chain_id`
    pub fn list_nodes(&self, chain_id: &str) -> Vec<Node> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.chain_id == chain_id)
            .cloned()
            .collect()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn get_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().get(node_id).cloned()
    }

    /// Look a node up by RPC address, ignoring case and trailing slashes
    pub fn find_by_rpc(&self, rpc: &str) -> Option<Node> {
        let key = normalize_address(rpc);
        self.nodes.read().values().find(|n| n.rpc_key() == key).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    /// Add a node. Fails if the id or the RPC address is already registered.
    pub fn add_node(&self, node: Node) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node.id) {
            return Err(Error::AlreadyExists(format!("node id {}", node.id)));
        }
        let key = node.rpc_key();
        if nodes.values().any(|n| n.rpc_key() == key) {
            return Err(Error::AlreadyExists(format!("rpc address {}", node.rpc)));
        }

        tracing::debug!(node_id = %node.id, rpc = %node.rpc, source = ?node.source, "Node registered");
        nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node, returning it if it existed
    pub fn remove_node(&self, node_id: &str) -> Option<Node> {
        let removed = self.nodes.write().shift_remove(node_id);
        if removed.is_some() {
            tracing::debug!(node_id = %node_id, "Node removed");
        }
        removed
    }

    /// Apply a probe result to the node's health snapshot.
    ///
    /// Returns the updated node, or `None` if it was removed meanwhile.
    pub fn update_health(&self, node_id: &str, result: &HealthCheckResult) -> Option<Node> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(node_id)?;

        node.healthy = result.is_healthy();
        node.last_checked_at = Some(result.checked_at);
        node.response_time_ms = result.response_time_ms;
        if result.block_height > 0 {
            node.block_height = result.block_height;
        }
        node.last_error.clone_from(&result.error);
        if node.healthy {
            node.last_healthy_at = Some(result.checked_at);
        }

        Some(node.clone())
    }

    /// Refresh display metadata of an existing node. Identity is untouched.
    pub fn refresh_metadata(&self, node_id: &str, metadata: NodeMetadata) -> bool {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get_mut(node_id) else {
            return false;
        };

        node.name = metadata.name;
        node.rest = metadata.rest;
        node.region = metadata.region;
        node.priority = metadata.priority;
        if metadata.websocket.is_some() {
            node.websocket = metadata.websocket;
        }
        true
    }

    /// Remove discovered nodes that stayed unhealthy longer than `max_age`
    pub fn prune_stale(&self, max_age: Duration) -> Vec<Node> {
        let mut nodes = self.nodes.write();
        let stale: Vec<String> = nodes
            .values()
            .filter(|n| n.is_stale(max_age))
            .map(|n| n.id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| nodes.shift_remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
