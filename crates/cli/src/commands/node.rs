//! Node command implementation
//!
//! This module implements the `pychain node` command: it opens the local
//! store, joins the network through the configured boot nodes and serves the
//! node API until Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use pychain_adapters::{HttpServer, HttpTransport, ServerConfig};
use pychain_network::{GuidPolicy, NodeConfig, PychainNode};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GuidPolicyArg {
    /// Generate the GUID on this node
    Local,
    /// Let a boot node allocate the GUID
    BootAssigned,
}

impl From<GuidPolicyArg> for GuidPolicy {
    fn from(arg: GuidPolicyArg) -> Self {
        match arg {
            GuidPolicyArg::Local => GuidPolicy::Local,
            GuidPolicyArg::BootAssigned => GuidPolicy::BootAssigned,
        }
    }
}

/// Arguments for the node command
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Interface to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    pub port: u16,
    /// Address other nodes should use (host:port); learned from boot nodes if unset
    #[arg(long, env = "ADVERTISE_ADDRESS")]
    pub advertise: Option<String>,
    /// Local storage directory
    #[arg(long, env = "STORAGE_DIR", default_value = ".pychain")]
    pub storage_dir: PathBuf,
    /// Boot node addresses, comma separated
    #[arg(long, env = "BOOT_NODES", value_delimiter = ',')]
    pub boot_nodes: Vec<String>,
    /// Advertise this node as a boot node
    #[arg(long, env = "IS_BOOT_NODE")]
    pub boot_node: bool,
    /// Where a fresh node gets its GUID from
    #[arg(long, env = "GUID_POLICY", value_enum, default_value_t = GuidPolicyArg::BootAssigned)]
    pub guid_policy: GuidPolicyArg,
    #[arg(long, env = "MAX_BOOT_NODES", default_value_t = 3)]
    pub max_boot_nodes: usize,
    /// Seconds between sync cycles
    #[arg(long, env = "NETWORK_SYNC_INTERVAL", default_value_t = 60)]
    pub sync_interval: u64,
    /// Upper bound of the random extra delay, in seconds
    #[arg(long, env = "NETWORK_SYNC_JITTER", default_value_t = 30)]
    pub sync_jitter: u64,
    /// Sync cycles between address checks
    #[arg(long, env = "ADDRESS_CHECK_FREQUENCY", default_value_t = 25)]
    pub address_check_frequency: u64,
    #[arg(long, env = "PEER_TIMEOUT_MS", default_value_t = 1000)]
    pub peer_timeout_ms: u64,
    #[arg(long, env = "MAX_FAILURES", default_value_t = 3)]
    pub max_failures: u32,
    #[arg(long, env = "MAX_PEERS", default_value_t = 32)]
    pub max_peers: usize,
    #[arg(long, env = "MAX_SYNC_PEERS", default_value_t = 16)]
    pub max_sync_peers: usize,
    #[arg(long, env = "SEEN_CAPACITY", default_value_t = 4096)]
    pub seen_capacity: usize,
    /// Seconds a message id is remembered for deduplication
    #[arg(long, env = "SEEN_TTL", default_value_t = 600)]
    pub seen_ttl: u64,
    /// Delivered messages buffered for the application
    #[arg(long, env = "DELIVERY_CAPACITY", default_value_t = 1024)]
    pub delivery_capacity: usize,
}

impl NodeArgs {
    pub fn into_config(self) -> NodeConfig {
        NodeConfig {
            listen_addr: SocketAddr::new(self.host, self.port),
            advertise_address: self.advertise,
            storage_dir: self.storage_dir,
            boot_nodes: self
                .boot_nodes
                .into_iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
            is_boot_node: self.boot_node,
            guid_policy: self.guid_policy.into(),
            max_boot_nodes: self.max_boot_nodes,
            network_sync_interval_secs: self.sync_interval,
            network_sync_jitter_secs: self.sync_jitter,
            address_check_frequency: self.address_check_frequency,
            peer_timeout_ms: self.peer_timeout_ms,
            max_failures: self.max_failures,
            max_peers: self.max_peers,
            max_sync_peers: self.max_sync_peers,
            seen_capacity: self.seen_capacity,
            seen_ttl_secs: self.seen_ttl,
            delivery_capacity: self.delivery_capacity,
            ..Default::default()
        }
    }
}

/// Execute the node command
pub async fn execute_node_command(args: NodeArgs) -> Result<()> {
    let config = args.into_config();
    config.validate().context("Invalid node configuration")?;
    validate_storage_dir(&config.storage_dir)?;

    println!("🌐 Starting pychain node...");
    println!("📁 Storage: {}", config.storage_dir.display());
    println!("🔌 Listening on: {}", config.listen_addr);
    if config.boot_nodes.is_empty() {
        println!("🌱 No boot nodes configured, starting as seed node");
    } else {
        println!("🤝 Boot nodes: {}", config.boot_nodes.join(", "));
    }
    println!();

    let transport = Arc::new(HttpTransport::new(config.peer_timeout()));
    let server_config = ServerConfig {
        listen_addr: config.listen_addr,
    };

    let node = Arc::new(
        PychainNode::open(config, transport).context("Failed to open pychain node")?,
    );

    if let Some(mut messages) = node.take_messages().await {
        tokio::spawn(async move {
            while let Some(envelope) = messages.recv().await {
                let key = envelope
                    .key()
                    .map(|k| k.to_string())
                    .unwrap_or_default();
                info!("Delivered message {}: {:?}", key, envelope.body);
            }
        });
    }

    node.start().await;

    println!("🔄 Node running... Press Ctrl+C to shutdown");
    let server = HttpServer::new(server_config, node.clone());
    server
        .run(wait_for_shutdown())
        .await
        .context("HTTP server failed")?;

    println!("\n🛑 Shutting down node...");
    node.shutdown()
        .await
        .context("Failed to shutdown node gracefully")?;

    println!("✅ Node shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Make sure the storage directory exists and is writable
pub fn validate_storage_dir(storage_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(storage_dir).with_context(|| {
        format!("Failed to create storage directory: {}", storage_dir.display())
    })?;

    let test_file = storage_dir.join(".pychain_write_test");
    match std::fs::write(&test_file, b"test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&test_file);
            Ok(())
        }
        Err(e) => {
            anyhow::bail!("Cannot write to storage directory {}: {}", storage_dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        node: NodeArgs,
    }

    #[test]
    fn test_validate_storage_dir() {
        let temp_dir = TempDir::new().unwrap();
        let storage = temp_dir.path().join("nested").join("db");

        assert!(validate_storage_dir(&storage).is_ok());
        assert!(storage.is_dir());
    }

    #[test]
    fn test_storage_dir_must_be_a_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        assert!(validate_storage_dir(&file).is_err());
    }

    #[test]
    fn test_defaults_match_node_config() {
        let args = Harness::parse_from(["pychain"]).node;
        let config = args.into_config();
        let defaults = NodeConfig::default();

        assert_eq!(config.listen_addr, defaults.listen_addr);
        assert_eq!(config.max_failures, defaults.max_failures);
        assert_eq!(config.delivery_capacity, defaults.delivery_capacity);
        assert_eq!(config.network_sync_interval_secs, 60);
        assert_eq!(config.guid_policy, GuidPolicy::BootAssigned);
    }

    #[test]
    fn test_boot_nodes_are_comma_separated() {
        let args = Harness::parse_from([
            "pychain",
            "--boot-nodes",
            "10.0.0.1:8000,10.0.0.2:8000",
            "--guid-policy",
            "local",
            "--boot-node",
        ])
        .node;
        let config = args.into_config();

        assert_eq!(config.boot_nodes, vec!["10.0.0.1:8000", "10.0.0.2:8000"]);
        assert_eq!(config.guid_policy, GuidPolicy::Local);
        assert!(config.is_boot_node);
        assert!(config.validate().is_ok());
    }
}
