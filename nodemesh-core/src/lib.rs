//! Shared configuration and logging for nodemesh

pub mod config;
pub mod logging;
pub mod timeouts;

pub use config::{
    BreakerConfig, Config, CustomNodeConfig, DiscoveryConfig, DiscoverySourceConfig,
    ExecutorConfig, HealthConfig, LoggingConfig, NetworkConfig, SelectionConfig,
    SelectionStrategy,
};
