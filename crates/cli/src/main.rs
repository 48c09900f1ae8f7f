use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
use commands::{
    execute_broadcast_command, execute_node_command, execute_peers_command,
    execute_status_command, BroadcastArgs, NodeArgs, QueryArgs,
};

/// Default log filter when `RUST_LOG` is not set
const DEFAULT_LOG_FILTER: &str = "pychain_network=debug,pychain_adapters=debug,info";

#[derive(Parser)]
#[command(name = "pychain")]
#[command(about = "Pychain - peer-to-peer membership and gossip node")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pychain node
    Node(NodeArgs),
    /// Show a node's identity and peer count
    Status(QueryArgs),
    /// List the peers a node knows
    Peers(QueryArgs),
    /// Originate a broadcast at a node
    Broadcast(BroadcastArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    match cli.command {
        Commands::Node(args) => execute_node_command(args).await,
        Commands::Status(args) => execute_status_command(args).await,
        Commands::Peers(args) => execute_peers_command(args).await,
        Commands::Broadcast(args) => execute_broadcast_command(args).await,
    }
}
