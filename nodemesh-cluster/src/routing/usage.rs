//! Per-node request usage counters

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub requests: u64,
    pub failures: u64,
    pub last_used: Option<DateTime<Utc>>,
}

/// Usage counters keyed by node id. Written only by the request executor.
#[derive(Debug, Default)]
pub struct UsageTracker {
    stats: DashMap<String, UsageStats>,
}

impl UsageTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request about to be sent to `node_id`
    pub fn record_request(&self, node_id: &str) {
        let mut entry = self.stats.entry(node_id.to_string()).or_default();
        entry.requests += 1;
        entry.last_used = Some(Utc::now());
    }

    pub fn record_failure(&self, node_id: &str) {
        self.stats.entry(node_id.to_string()).or_default().failures += 1;
    }

    /// Stats for `node_id`; zeroed if the node never served a request
    pub fn get(&self, node_id: &str) -> UsageStats {
        self.stats
            .get(node_id)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, node_id: &str) {
        self.stats.remove(node_id);
    }

    pub fn snapshot(&self) -> HashMap<String, UsageStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_requests_and_failures() {
        let usage = UsageTracker::new();
        usage.record_request("a");
        usage.record_request("a");
        usage.record_failure("a");

        let stats = usage.get("a");
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.failures, 1);
        assert!(stats.last_used.is_some());

        assert_eq!(usage.get("unknown"), UsageStats::default());

        usage.remove("a");
        assert!(usage.snapshot().is_empty());
    }
}
