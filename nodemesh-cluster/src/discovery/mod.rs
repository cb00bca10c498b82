//! Node discovery, health monitoring and selection

pub mod catalog;
pub mod circuit_breaker;
pub mod health_monitor;
pub mod load_balancer;
pub mod node_registry;
pub mod probe;
pub mod source_discovery;
pub mod sources;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use health_monitor::{HealthEvent, HealthMonitor};
pub use load_balancer::{NodeSelector, SelectionStrategy};
pub use node_registry::{HealthCheckResult, Node, NodeMetadata, NodeRegistry, NodeSource};
pub use probe::{HttpProber, NodeProber, StatusProbe};
pub use source_discovery::{DiscoveryResult, DiscoveryRound, DiscoveryService};
