//! pownode - proof-of-work network node
//!
//! Discovers peers through bootstrap nodes and peer exchange, then gossips
//! proof CIDs to them at a self-regulating cadence.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pow_p2p::{DiscoveryEngine, GossipBroadcaster};
use pownode::config::{DiscoverySection, GossipSection};
use pownode::{LoggingHandler, NodeConfig};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "pownode")]
#[command(about = "Proof-of-work network node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery and gossip until interrupted
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/pownode/config.json")]
        config: PathBuf,

        /// Proof CIDs to announce once the node is up
        #[arg(long = "announce", value_name = "CID")]
        announce: Vec<String>,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/pownode/config.json")]
        output: PathBuf,

        /// Bootstrap address in host:port form (repeatable)
        #[arg(long = "bootstrap", value_name = "HOST:PORT")]
        bootstrap: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("pownode=info".parse()?)
                .add_directive("pow_p2p=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, announce } => run(config, announce).await,
        Commands::InitConfig { output, bootstrap } => init_config(output, bootstrap),
    }
}

async fn run(config_path: PathBuf, announce: Vec<String>) -> anyhow::Result<()> {
    let config = NodeConfig::from_file(&config_path)?;
    let peer_id = config.peer_id();
    info!(config = %config_path.display(), peer_id = %peer_id, "starting pownode");

    let discovery = Arc::new(DiscoveryEngine::new(
        peer_id.clone(),
        config.discovery_config(),
    )?);
    let gossip = GossipBroadcaster::new(peer_id, config.gossip_config(), discovery.clone())?;
    gossip.set_handler(Arc::new(LoggingHandler::new()));

    if !discovery.start() {
        anyhow::bail!("discovery failed to start");
    }
    if !gossip.start_equilibrium_loops() {
        discovery.stop().await;
        anyhow::bail!("gossip failed to start");
    }
    info!(
        discovery_addr = ?discovery.local_addr(),
        gossip_addr = ?gossip.local_addr(),
        "node running"
    );

    for cid in &announce {
        if gossip.announce_proof(cid) {
            info!(cid = %cid, "proof queued");
        } else {
            warn!(cid = %cid, "proof rejected or already queued");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    gossip.stop_equilibrium_loops().await;
    discovery.stop().await;

    let stats = discovery.get_peer_statistics();
    info!(
        total_peers = stats.total_peers,
        connected_peers = stats.connected_peers,
        "pownode stopped"
    );
    Ok(())
}

fn init_config(output: PathBuf, bootstrap: Vec<String>) -> anyhow::Result<()> {
    let defaults = NodeConfig::default();
    let config = NodeConfig {
        peer_id: Some(pow_p2p::PeerId::random().to_string()),
        discovery: DiscoverySection {
            bootstrap_nodes: bootstrap,
            listen_port: Some(9000),
            ..defaults.discovery
        },
        gossip: GossipSection {
            listen_port: Some(9100),
            ..defaults.gossip
        },
        ..defaults
    };
    config.validate()?;

    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Add bootstrap addresses if needed, then run:");
    println!("  pownode run --config {}", output.display());

    Ok(())
}
