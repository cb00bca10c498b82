pub mod discovery;
pub mod error;
pub mod mesh;
pub mod routing;

pub use discovery::{
    CircuitBreaker, CircuitState, DiscoveryResult, DiscoveryRound, DiscoveryService, HealthCheckResult,
    HealthEvent, HealthMonitor, HttpProber, Node, NodeProber, NodeRegistry, NodeSelector, NodeSource,
    SelectionStrategy, StatusProbe,
};
pub use error::{Error, Result};
pub use mesh::{NetworkStats, NodeMesh, NodeStats};
pub use routing::{ConnectionManager, Connector, ExecuteOptions, RequestExecutor, UsageStats, UsageTracker};
