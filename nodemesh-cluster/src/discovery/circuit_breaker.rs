//! Per-node circuit breaker
//!
//! A node that keeps failing real requests is taken out of rotation for a
//! recovery window, then given a single probationary trial. The Open to
//! HalfOpen transition is evaluated lazily (`now >= opened_at + timeout`)
//! whenever state is read, so no timer is held per node.
//!
//! The trial is claimed with `try_acquire`. While it is in flight the node
//! reads as unavailable to everyone else. A claim whose outcome never
//! arrives lapses after one recovery window.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use nodemesh_core::BreakerConfig;

/// Circuit breaker state for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Routing suppressed until the recovery timeout elapses
    Open,
    /// One trial allowed; success closes, failure re-opens
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
struct BreakerEntry {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// When the HalfOpen trial was handed out
    trial_started: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
        }
    }
}

impl BreakerEntry {
    /// Promote Open to HalfOpen once the recovery window has passed
    fn refresh(&mut self, node_id: &str, recovery_timeout: Duration, now: Instant) {
        if self.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = self.opened_at else {
            return;
        };
        if now.saturating_duration_since(opened_at) >= recovery_timeout {
            self.state = CircuitState::HalfOpen;
            tracing::info!(node_id = %node_id, "Circuit half-open, allowing trial request");
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started = None;
    }

    fn trial_in_flight(&self, recovery_timeout: Duration, now: Instant) -> bool {
        self.trial_started
            .is_some_and(|started| now.saturating_duration_since(started) < recovery_timeout)
    }

    fn admits(&self, recovery_timeout: Duration, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !self.trial_in_flight(recovery_timeout, now),
        }
    }
}

/// Snapshot of one node's breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Circuit breakers for every node, keyed by node id.
///
/// Nodes without an entry are `Closed`. Only the request executor feeds
/// outcomes in.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(&BreakerConfig::default())
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    #[must_use]
    pub const fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Current state, applying any due Open to HalfOpen transition
    pub fn state(&self, node_id: &str) -> CircuitState {
        self.snapshot(node_id).state
    }

    pub fn snapshot(&self, node_id: &str) -> BreakerSnapshot {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(node_id) else {
            return BreakerSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            };
        };
        entry.refresh(node_id, self.recovery_timeout, Instant::now());
        BreakerSnapshot {
            state: entry.state,
            consecutive_failures: entry.consecutive_failures,
        }
    }

    /// Whether the breaker would let a request through right now.
    ///
    /// `Open` never does. `HalfOpen` does only while its trial is unclaimed.
    pub fn is_available(&self, node_id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(node_id) else {
            return true;
        };
        entry.refresh(node_id, self.recovery_timeout, now);
        entry.admits(self.recovery_timeout, now)
    }

    /// Claim permission to send one request to `node_id`.
    ///
    /// Closed always grants. HalfOpen grants exactly one caller until an
    /// outcome is recorded.
    pub fn try_acquire(&self, node_id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(node_id) else {
            return true;
        };
        entry.refresh(node_id, self.recovery_timeout, now);
        if !entry.admits(self.recovery_timeout, now) {
            return false;
        }
        if entry.state == CircuitState::HalfOpen {
            entry.trial_started = Some(now);
            tracing::debug!(node_id = %node_id, "Trial request claimed");
        }
        true
    }

    /// Record a successful request.
    ///
    /// From Closed or HalfOpen the failure counter resets and the breaker
    /// closes. A success reported while still Open is ignored.
    pub fn record_success(&self, node_id: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(node_id) else {
            return;
        };
        entry.refresh(node_id, self.recovery_timeout, Instant::now());

        match entry.state {
            CircuitState::Open => {
                tracing::debug!(node_id = %node_id, "Ignoring success reported while circuit is open");
            }
            CircuitState::HalfOpen => {
                tracing::info!(node_id = %node_id, "Circuit closed after successful trial");
                *entry = BreakerEntry::default();
            }
            CircuitState::Closed => {
                *entry = BreakerEntry::default();
            }
        }
    }

    /// Record a failed request, returning the resulting state
    pub fn record_failure(&self, node_id: &str) -> CircuitState {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(node_id.to_string()).or_default();
        entry.refresh(node_id, self.recovery_timeout, now);
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        match entry.state {
            CircuitState::HalfOpen => {
                entry.open(now);
                tracing::warn!(
                    node_id = %node_id,
                    consecutive_failures = entry.consecutive_failures,
                    "Trial request failed, circuit re-opened"
                );
            }
            CircuitState::Closed if entry.consecutive_failures >= self.failure_threshold => {
                entry.open(now);
                tracing::warn!(
                    node_id = %node_id,
                    consecutive_failures = entry.consecutive_failures,
                    recovery_timeout_secs = self.recovery_timeout.as_secs(),
                    "Circuit opened"
                );
            }
            CircuitState::Closed | CircuitState::Open => {}
        }

        entry.state
    }

    /// Forget a node's breaker (e.g. after the node is removed)
    pub fn reset(&self, node_id: &str) {
        self.entries.lock().remove(node_id);
    }

    /// Snapshot of every tracked breaker
    pub fn all_snapshots(&self) -> HashMap<String, BreakerSnapshot> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .map(|(id, entry)| {
                entry.refresh(id, self.recovery_timeout, now);
                (
                    id.clone(),
                    BreakerSnapshot {
                        state: entry.state,
                        consecutive_failures: entry.consecutive_failures,
                    },
                )
            })
            .collect()
    }
}
