use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::{error, info};

use nodemesh_cluster::{NetworkStats, Node, NodeMesh, SelectionStrategy};
use nodemesh_core::{logging, Config};

#[derive(Parser, Debug)]
#[command(name = "nodemesh")]
#[command(about = "Multi-node connectivity for blockchain RPC endpoints", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, global = true, env = "NODEMESH_CONFIG")]
    config: Option<String>,

    /// Override the configured chain id
    #[arg(long, global = true)]
    chain_id: Option<String>,

    /// Override the configured selection strategy
    #[arg(long, global = true)]
    strategy: Option<SelectionStrategy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor and discover nodes until interrupted
    Run {
        /// Seconds between stats reports
        #[arg(long, default_value = "60")]
        stats_interval_secs: u64,
    },
    /// Test connectivity to a single node
    Probe {
        #[arg(long)]
        rpc: String,
        #[arg(long)]
        rest: String,
        #[arg(long, default_value = "3")]
        retries: u32,
    },
    /// Run one discovery round and print the outcome
    Discover {
        #[arg(long)]
        json: bool,
    },
    /// Probe every known node once and print the table
    Nodes {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(chain_id) = args.chain_id {
        config.network.chain_id = chain_id;
    }
    if let Some(strategy) = args.strategy {
        config.selection.strategy = strategy;
    }

    // Fail fast on misconfigurations
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    logging::init_logging(&config.logging)?;

    match args.command {
        Command::Run { stats_interval_secs } => run(config, Duration::from_secs(stats_interval_secs.max(1))).await,
        Command::Probe { rpc, rest, retries } => probe(config, rpc, rest, retries).await,
        Command::Discover { json } => discover(config, json).await,
        Command::Nodes { json } => nodes(config, json).await,
    }
}

async fn run(config: Config, stats_interval: Duration) -> Result<()> {
    let mesh = NodeMesh::new(config)?;
    info!(chain_id = %mesh.chain_id(), "nodemesh starting");

    let _observer = mesh.add_observer(|event| {
        if !event.node.healthy {
            tracing::debug!(
                node_id = %event.node.id,
                error = event.result.error.as_deref().unwrap_or("catching up"),
                "Health event"
            );
        }
    });
    mesh.start();

    let mut ticker = tokio::time::interval(stats_interval);
    // first tick fires immediately, before any probe has landed
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown_signal() => break,
            _ = ticker.tick() => log_stats(&mesh.get_network_stats()),
        }
    }

    mesh.shutdown().await;
    Ok(())
}

async fn probe(config: Config, rpc: String, rest: String, retries: u32) -> Result<()> {
    let chain_id = config.network.chain_id.clone();
    let mesh = NodeMesh::new(config)?;
    let node = Node::new("probe", "probe", rpc, rest, chain_id);

    if !mesh.test_connectivity(&node, retries).await {
        let result = mesh.probe_node(&node).await;
        error!(rpc = %node.rpc, error = result.error.as_deref().unwrap_or("catching up"), "Node unreachable");
        anyhow::bail!("{} is not reachable after {} attempt(s)", node.rpc, retries.max(1));
    }

    let result = mesh.probe_node(&node).await;
    println!(
        "{} reachable: height={} latency={}ms caught_up={}",
        node.rpc, result.block_height, result.response_time_ms, result.caught_up
    );
    Ok(())
}

async fn discover(config: Config, json: bool) -> Result<()> {
    let mesh = NodeMesh::new(config)?;
    let round = mesh
        .run_discovery()
        .await
        .context("Discovery is disabled in the configuration")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&round)?);
        return Ok(());
    }

    for result in &round.results {
        match &result.error {
            None => println!("{:<24} ok      {} node(s)", result.source, result.nodes_found),
            Some(e) => println!("{:<24} failed  {e}", result.source),
        }
    }
    println!(
        "added={} refreshed={} rejected={} pruned={}",
        round.added.len(),
        round.refreshed,
        round.rejected,
        round.pruned.len()
    );
    for node in mesh.nodes().iter().filter(|n| n.is_discovered()) {
        println!("  {:<32} {:<8} {}", node.name, node.region, node.rpc);
    }
    Ok(())
}

async fn nodes(mut config: Config, json: bool) -> Result<()> {
    config.discovery.enabled = false;
    let mesh = NodeMesh::new(config)?;
    mesh.check_health().await;
    let stats = mesh.get_network_stats();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!(
        "{:<32} {:<8} {:>4} {:<9} {:>10} {:>12}  {}",
        "ID", "REGION", "PRIO", "HEALTHY", "LATENCY", "HEIGHT", "RPC"
    );
    for node in &stats.per_node {
        println!(
            "{:<32} {:<8} {:>4} {:<9} {:>8}ms {:>12}  {}",
            node.id, node.region, node.priority, node.healthy, node.response_time_ms, node.block_height, node.rpc
        );
    }
    match mesh.get_best_node() {
        Some(best) => println!("best ({}): {}", stats.strategy, best.id),
        None => println!("best ({}): none eligible", stats.strategy),
    }
    Ok(())
}

fn log_stats(stats: &NetworkStats) {
    info!(
        chain_id = %stats.chain_id,
        strategy = %stats.strategy,
        total_nodes = stats.total_nodes,
        healthy_nodes = stats.healthy_nodes,
        eligible_nodes = stats.eligible_nodes,
        average_response_time_ms = stats.average_response_time_ms,
        "Network stats"
    );
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
