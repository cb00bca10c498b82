//! Timeout defaults for outbound node traffic

use std::time::Duration;

/// Default bound for a single health probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound for one request attempt against a node
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound for fetching one discovery source
pub const DISCOVERY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
