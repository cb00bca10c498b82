//! Built-in seed nodes, public fallback nodes and discovery sources

use nodemesh_core::DiscoverySourceConfig;

use super::node_registry::{Node, NodeSource};

struct CatalogEntry {
    id: &'static str,
    name: &'static str,
    rpc: &'static str,
    rest: &'static str,
    region: &'static str,
    priority: u32,
}

const COSMOSHUB_SEEDS: &[CatalogEntry] = &[
    CatalogEntry {
        id: "cosmoshub-polkachu",
        name: "Polkachu",
        rpc: "https://cosmos-rpc.polkachu.com",
        rest: "https://cosmos-api.polkachu.com",
        region: "us",
        priority: 1,
    },
    CatalogEntry {
        id: "cosmoshub-publicnode",
        name: "PublicNode",
        rpc: "https://cosmos-rpc.publicnode.com",
        rest: "https://cosmos-rest.publicnode.com",
        region: "eu",
        priority: 2,
    },
    CatalogEntry {
        id: "cosmoshub-lavender",
        name: "Lavender.Five",
        rpc: "https://cosmoshub.rpc.lava.build",
        rest: "https://cosmoshub.lava.build",
        region: "global",
        priority: 3,
    },
];

const COSMOSHUB_FALLBACKS: &[CatalogEntry] = &[
    CatalogEntry {
        id: "cosmoshub-fallback-cosmos-directory",
        name: "cosmos.directory",
        rpc: "https://rpc.cosmos.directory/cosmoshub",
        rest: "https://rest.cosmos.directory/cosmoshub",
        region: "global",
        priority: 100,
    },
    CatalogEntry {
        id: "cosmoshub-fallback-stakin",
        name: "Stakin",
        rpc: "https://cosmos-rpc.stakin-nodes.com",
        rest: "https://cosmos-rest.stakin-nodes.com",
        region: "eu",
        priority: 101,
    },
];

const TESTNET_SEEDS: &[CatalogEntry] = &[CatalogEntry {
    id: "theta-polkachu",
    name: "Polkachu Testnet",
    rpc: "https://cosmos-testnet-rpc.polkachu.com",
    rest: "https://cosmos-testnet-api.polkachu.com",
    region: "us",
    priority: 1,
}];

const TESTNET_FALLBACKS: &[CatalogEntry] = &[CatalogEntry {
    id: "theta-fallback-publicnode",
    name: "PublicNode Testnet",
    rpc: "https://cosmos-testnet-rpc.publicnode.com",
    rest: "https://cosmos-testnet-rest.publicnode.com",
    region: "global",
    priority: 100,
}];

fn build(entries: &[CatalogEntry], chain_id: &str, source: &NodeSource) -> Vec<Node> {
    entries
        .iter()
        .map(|e| {
            Node::new(e.id, e.name, e.rpc, e.rest, chain_id)
                .with_region(e.region)
                .with_priority(e.priority)
                .with_source(source.clone())
        })
        .collect()
}

/// Seed nodes loaded into the registry at startup
#[must_use]
pub fn seed_nodes(chain_id: &str) -> Vec<Node> {
    match chain_id {
        "cosmoshub-4" => build(COSMOSHUB_SEEDS, chain_id, &NodeSource::Seed),
        "theta-testnet-001" => build(TESTNET_SEEDS, chain_id, &NodeSource::Seed),
        _ => Vec::new(),
    }
}

/// Public nodes tried, in order, only when no registry node is eligible
#[must_use]
pub fn fallback_nodes(chain_id: &str) -> Vec<Node> {
    match chain_id {
        "cosmoshub-4" => build(COSMOSHUB_FALLBACKS, chain_id, &NodeSource::Fallback),
        "theta-testnet-001" => build(TESTNET_FALLBACKS, chain_id, &NodeSource::Fallback),
        _ => Vec::new(),
    }
}

/// Discovery sources used when none are configured
#[must_use]
pub fn default_sources(chain_id: &str) -> Vec<DiscoverySourceConfig> {
    let registry_path = match chain_id {
        "cosmoshub-4" => "cosmoshub",
        "theta-testnet-001" => "testnets/cosmoshubtestnet",
        _ => return Vec::new(),
    };

    vec![DiscoverySourceConfig {
        name: "chain-registry".to_string(),
        url: format!(
            "https://raw.githubusercontent.com/cosmos/chain-registry/master/{registry_path}/chain.json"
        ),
        priority: 1,
        active: true,
    }]
}
