//! Node configuration.
//!
//! Plain values handed to the engine by whoever loads them (the CLI reads
//! arguments and environment variables). [`NodeConfig::validate`] must pass
//! before a node is opened.

use pychain_protocol::{validate_address, BOOT_NODE_CAPABILITY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::bootstrap::BootstrapConfig;
use crate::gossip::{GossipConfig, DEFAULT_DELIVERY_CAPACITY};
use crate::identity::GuidPolicy;
use crate::sync::SyncConfig;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid boot node address '{address}': {reason}")]
    InvalidBootNode { address: String, reason: String },

    #[error("Invalid advertise address '{address}': {reason}")]
    InvalidAdvertiseAddress { address: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Configuration for a pychain node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the HTTP server binds to
    pub listen_addr: SocketAddr,
    /// Address other nodes should use; derived from the boot nodes' view if unset
    pub advertise_address: Option<String>,
    /// Directory of the sled database
    pub storage_dir: PathBuf,
    /// Boot node addresses (host:port)
    pub boot_nodes: Vec<String>,
    /// Advertise the boot-node capability
    pub is_boot_node: bool,
    pub guid_policy: GuidPolicy,
    pub max_boot_nodes: usize,
    pub network_sync_interval_secs: u64,
    pub network_sync_jitter_secs: u64,
    /// Sync cycles between address checks
    pub address_check_frequency: u64,
    pub peer_timeout_ms: u64,
    pub max_failures: u32,
    pub max_peers: usize,
    pub max_sync_peers: usize,
    pub seen_capacity: usize,
    pub seen_ttl_secs: u64,
    /// Deliveries queued for the application before new ones are dropped
    pub delivery_capacity: usize,
    /// Extra capabilities advertised in our peer record
    pub capabilities: BTreeSet<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            advertise_address: None,
            storage_dir: PathBuf::from(".pychain"),
            boot_nodes: Vec::new(),
            is_boot_node: false,
            guid_policy: GuidPolicy::default(),
            max_boot_nodes: 3,
            network_sync_interval_secs: 60,
            network_sync_jitter_secs: 30,
            address_check_frequency: 25,
            peer_timeout_ms: 1000,
            max_failures: 3,
            max_peers: 32,
            max_sync_peers: 16,
            seen_capacity: 4096,
            seen_ttl_secs: 600,
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
            capabilities: BTreeSet::new(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for address in &self.boot_nodes {
            validate_address(address).map_err(|e| ConfigError::InvalidBootNode {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Some(address) = &self.advertise_address {
            validate_address(address).map_err(|e| ConfigError::InvalidAdvertiseAddress {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        }

        positive("max_boot_nodes", self.max_boot_nodes as u64)?;
        positive("network_sync_interval_secs", self.network_sync_interval_secs)?;
        positive("address_check_frequency", self.address_check_frequency)?;
        positive("peer_timeout_ms", self.peer_timeout_ms)?;
        positive("max_failures", u64::from(self.max_failures))?;
        positive("max_peers", self.max_peers as u64)?;
        positive("max_sync_peers", self.max_sync_peers as u64)?;
        positive("seen_capacity", self.seen_capacity as u64)?;
        positive("seen_ttl_secs", self.seen_ttl_secs)?;
        positive("delivery_capacity", self.delivery_capacity as u64)?;

        Ok(())
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Capabilities advertised in our own peer record.
    pub fn advertised_capabilities(&self) -> BTreeSet<String> {
        let mut capabilities = self.capabilities.clone();
        if self.is_boot_node {
            capabilities.insert(BOOT_NODE_CAPABILITY.to_string());
        }
        capabilities
    }

    /// Address to advertise before anyone has told us how we look from outside.
    pub fn initial_address(&self) -> String {
        match &self.advertise_address {
            Some(address) => address.clone(),
            None if self.listen_addr.ip().is_unspecified() => {
                format!("127.0.0.1:{}", self.listen_addr.port())
            }
            None => self.listen_addr.to_string(),
        }
    }

    pub fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            boot_nodes: self.boot_nodes.clone(),
            max_boot_nodes: self.max_boot_nodes,
            peer_timeout: self.peer_timeout(),
            ..Default::default()
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            interval: Duration::from_secs(self.network_sync_interval_secs),
            jitter: Duration::from_secs(self.network_sync_jitter_secs),
            peer_timeout: self.peer_timeout(),
            address_check_frequency: self.address_check_frequency,
            max_sync_peers: self.max_sync_peers,
            max_peers: self.max_peers,
        }
    }

    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            peer_timeout: self.peer_timeout(),
            seen_capacity: self.seen_capacity,
            seen_ttl: Duration::from_secs(self.seen_ttl_secs),
            delivery_capacity: self.delivery_capacity,
        }
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
