use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::timeouts;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub selection: SelectionConfig,
    pub health: HealthConfig,
    pub breaker: BreakerConfig,
    pub executor: ExecutorConfig,
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub chain_id: String,
    /// Load the built-in seed nodes for `chain_id` at startup
    pub use_seed_catalog: bool,
    pub custom_nodes: Vec<CustomNodeConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            chain_id: "cosmoshub-4".to_string(),
            use_seed_catalog: true,
            custom_nodes: Vec::new(),
        }
    }
}

/// An operator-supplied node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomNodeConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub rpc: String,
    pub rest: String,
    #[serde(default)]
    pub websocket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub priority: u32,
}

fn default_region() -> String {
    "global".to_string()
}

/// Node selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Lowest priority rank first, ties broken by latency
    #[default]
    PriorityFirst,
    LowestLatency,
    RoundRobin,
    Random,
    /// Prefer nodes in the caller's region, else lowest latency
    GeographicNearest,
}

impl SelectionStrategy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PriorityFirst => "priority_first",
            Self::LowestLatency => "lowest_latency",
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::GeographicNearest => "geographic_nearest",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "priority_first" | "priority" => Ok(Self::PriorityFirst),
            "lowest_latency" | "latency" => Ok(Self::LowestLatency),
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "geographic_nearest" | "geographic" => Ok(Self::GeographicNearest),
            other => Err(format!("unknown selection strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub strategy: SelectionStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Capacity of the health event broadcast channel
    pub event_buffer: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            probe_timeout_secs: timeouts::PROBE_TIMEOUT.as_secs(),
            event_buffer: 256,
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

impl BreakerConfig {
    #[must_use]
    pub const fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    /// Delay unit between attempts; attempt `n` waits `n * retry_base_delay_ms`
    pub retry_base_delay_ms: u64,
    pub fallback_enabled: bool,
    pub fallback_probe_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout_secs: timeouts::REQUEST_TIMEOUT.as_secs(),
            retry_base_delay_ms: 1000,
            fallback_enabled: true,
            fallback_probe_retries: 1,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// External node-list source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoverySourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub active: bool,
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Discovered nodes unhealthy for longer than this are pruned
    pub max_unhealthy_age_secs: u64,
    /// Empty means "use the built-in sources for the configured chain"
    pub sources: Vec<DiscoverySourceConfig>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            request_timeout_secs: timeouts::DISCOVERY_FETCH_TIMEOUT.as_secs(),
            max_unhealthy_age_secs: 86_400,
            sources: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn max_unhealthy_age(&self) -> Duration {
        Duration::from_secs(self.max_unhealthy_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // NODEMESH_HEALTH__INTERVAL_SECS=10 etc.
        builder = builder.add_source(
            Environment::with_prefix("NODEMESH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check for settings that would leave the mesh unable to route.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.network.chain_id.trim().is_empty() {
            errors.push("network.chain_id must not be empty".to_string());
        }
        for node in &self.network.custom_nodes {
            if node.id.trim().is_empty() {
                errors.push(format!("custom node with rpc '{}' has an empty id", node.rpc));
            }
            for (field, value) in [("rpc", &node.rpc), ("rest", &node.rest)] {
                if url::Url::parse(value).is_err() {
                    errors.push(format!("custom node '{}': invalid {field} url '{value}'", node.id));
                }
            }
        }
        if self.health.interval_secs == 0 {
            errors.push("health.interval_secs must be greater than 0".to_string());
        }
        if self.health.probe_timeout_secs == 0 {
            errors.push("health.probe_timeout_secs must be greater than 0".to_string());
        }
        if self.health.event_buffer == 0 {
            errors.push("health.event_buffer must be greater than 0".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            errors.push("breaker.failure_threshold must be greater than 0".to_string());
        }
        if self.executor.max_retries == 0 {
            errors.push("executor.max_retries must be greater than 0".to_string());
        }
        if self.executor.request_timeout_secs == 0 {
            errors.push("executor.request_timeout_secs must be greater than 0".to_string());
        }
        if self.discovery.interval_secs == 0 {
            errors.push("discovery.interval_secs must be greater than 0".to_string());
        }
        for source in &self.discovery.sources {
            if url::Url::parse(&source.url).is_err() {
                errors.push(format!("discovery source '{}': invalid url '{}'", source.name, source.url));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.network.chain_id, "cosmoshub-4");
        assert_eq!(config.selection.strategy, SelectionStrategy::PriorityFirst);
        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.health.probe_timeout_secs, 5);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.recovery_timeout_secs, 60);
        assert_eq!(config.executor.max_retries, 3);
        assert_eq!(config.discovery.interval_secs, 3600);
        assert_eq!(config.discovery.max_unhealthy_age_secs, 86_400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("round-robin".parse::<SelectionStrategy>(), Ok(SelectionStrategy::RoundRobin));
        assert_eq!("LOWEST_LATENCY".parse::<SelectionStrategy>(), Ok(SelectionStrategy::LowestLatency));
        assert_eq!("geographic".parse::<SelectionStrategy>(), Ok(SelectionStrategy::GeographicNearest));
        assert!("fastest".parse::<SelectionStrategy>().is_err());
        assert_eq!(SelectionStrategy::Random.to_string(), "random");
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = Config::default();
        config.network.chain_id = String::new();
        config.health.interval_secs = 0;
        config.breaker.failure_threshold = 0;
        config.network.custom_nodes.push(CustomNodeConfig {
            id: "mine".to_string(),
            name: "Mine".to_string(),
            rpc: "not a url".to_string(),
            rest: "http://localhost:1317".to_string(),
            websocket: None,
            region: "eu".to_string(),
            priority: 0,
        });

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("invalid rpc url")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[network]
chain_id = "theta-testnet-001"
use_seed_catalog = false

[[network.custom_nodes]]
id = "local"
rpc = "http://127.0.0.1:26657"
rest = "http://127.0.0.1:1317"
priority = 1

[selection]
strategy = "round_robin"

[breaker]
failure_threshold = 3
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.network.chain_id, "theta-testnet-001");
        assert!(!config.network.use_seed_catalog);
        assert_eq!(config.network.custom_nodes.len(), 1);
        assert_eq!(config.network.custom_nodes[0].region, "global");
        assert_eq!(config.selection.strategy, SelectionStrategy::RoundRobin);
        assert_eq!(config.breaker.failure_threshold, 3);
        // untouched sections keep their defaults
        assert_eq!(config.breaker.recovery_timeout_secs, 60);
        assert_eq!(config.health.interval_secs, 30);
    }
}
