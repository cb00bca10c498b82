//! Node selection across eligible nodes
//!
//! Eligibility combines two independent gates: the registry health snapshot
//! and the per-node circuit breaker. Strategies only ever see eligible nodes.

use chrono::{Local, Offset};
use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use nodemesh_core::SelectionStrategy;

use super::circuit_breaker::CircuitBreaker;
use super::node_registry::Node;

/// A node may receive traffic iff it is healthy and its breaker is not open
pub fn is_eligible(node: &Node, breaker: &CircuitBreaker) -> bool {
    node.healthy && breaker.is_available(&node.id)
}

/// Filter `nodes` down to the eligible set
pub fn eligible_nodes(nodes: Vec<Node>, breaker: &CircuitBreaker) -> Vec<Node> {
    nodes
        .into_iter()
        .filter(|n| is_eligible(n, breaker))
        .collect()
}

/// Best-effort caller region from the local UTC offset
#[must_use]
pub fn estimate_local_region() -> &'static str {
    region_for_utc_offset(Local::now().offset().fix().local_minus_utc())
}

/// Map a UTC offset in seconds to a coarse region tag
#[must_use]
pub const fn region_for_utc_offset(offset_secs: i32) -> &'static str {
    let hours = offset_secs / 3600;
    if hours <= -3 {
        "us"
    } else if hours <= 4 {
        "eu"
    } else {
        "asia"
    }
}

/// Picks the node for the next request
#[derive(Debug)]
pub struct NodeSelector {
    strategy: RwLock<SelectionStrategy>,
    round_robin_index: AtomicUsize,
    local_region: String,
}

impl Default for NodeSelector {
    fn default() -> Self {
        Self::new(SelectionStrategy::default())
    }
}

impl NodeSelector {
    #[must_use]
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            round_robin_index: AtomicUsize::new(0),
            local_region: estimate_local_region().to_string(),
        }
    }

    /// Override the caller region used by `GeographicNearest`
    #[must_use]
    pub fn with_local_region(mut self, region: impl Into<String>) -> Self {
        self.local_region = region.into();
        self
    }

    pub fn strategy(&self) -> SelectionStrategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: SelectionStrategy) {
        let previous = std::mem::replace(&mut *self.strategy.write(), strategy);
        if previous != strategy {
            tracing::info!(from = %previous, to = %strategy, "Selection strategy changed");
        }
    }

    #[must_use]
    pub fn local_region(&self) -> &str {
        &self.local_region
    }

    /// Select from an already-eligible set with the current strategy
    pub fn select(&self, eligible: &[Node]) -> Option<Node> {
        self.select_with(self.strategy(), eligible)
    }

    pub fn select_with(&self, strategy: SelectionStrategy, eligible: &[Node]) -> Option<Node> {
        if eligible.is_empty() {
            return None;
        }

        let selected = match strategy {
            SelectionStrategy::PriorityFirst => eligible
                .iter()
                .min_by_key(|n| (n.priority, n.response_time_ms)),
            SelectionStrategy::LowestLatency => lowest_latency(eligible),
            SelectionStrategy::RoundRobin => {
                let mut sorted: Vec<&Node> = eligible.iter().collect();
                // id breaks ties so the cycle order is stable across calls
                sorted.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
                let index = self.round_robin_index.fetch_add(1, Ordering::AcqRel) % sorted.len();
                Some(sorted[index])
            }
            SelectionStrategy::Random => eligible.choose(&mut rand::rng()),
            SelectionStrategy::GeographicNearest => {
                let regional: Vec<Node> = eligible
                    .iter()
                    .filter(|n| n.region.eq_ignore_ascii_case(&self.local_region))
                    .cloned()
                    .collect();
                if regional.is_empty() {
                    tracing::trace!(region = %self.local_region, "No regional node, using lowest latency");
                    lowest_latency(eligible)
                } else {
                    return lowest_latency(&regional).cloned();
                }
            }
        };

        selected.cloned()
    }
}

fn lowest_latency(nodes: &[Node]) -> Option<&Node> {
    nodes.iter().min_by_key(|n| (n.response_time_ms, n.priority))
}
