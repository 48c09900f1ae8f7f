//! Node identity lifecycle.
//!
//! A node's GUID is allocated once, persisted before the node takes part in
//! sync or gossip, and reused unconditionally on every restart. Only the
//! advertised address may change afterwards.

use chrono::{DateTime, Utc};
use pychain_protocol::Guid;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::storage::{NodeStore, StorageError};

/// This node's persisted identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub guid: Guid,
    /// Address other nodes should use to reach us
    pub address: String,
    pub created_at: DateTime<Utc>,
}

/// Where a node without a persisted identity gets its GUID from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidPolicy {
    /// Generate the GUID locally
    Local,
    /// Ask a boot node to allocate one (local on seed and boot nodes)
    #[default]
    BootAssigned,
}

/// Read-mostly holder of the node identity, written through to storage.
pub struct IdentityStore {
    store: NodeStore,
    current: RwLock<Option<Identity>>,
}

impl IdentityStore {
    /// Load whatever identity the store holds.
    pub fn open(store: NodeStore) -> Result<Self, StorageError> {
        let current = store.load_identity()?;

        if let Some(identity) = &current {
            info!("Loaded persisted identity {} ({})", identity.guid, identity.address);
        }

        Ok(Self {
            store,
            current: RwLock::new(current),
        })
    }

    pub async fn current(&self) -> Option<Identity> {
        self.current.read().await.clone()
    }

    pub async fn guid(&self) -> Option<Guid> {
        self.current.read().await.as_ref().map(|i| i.guid.clone())
    }

    /// Return the persisted identity, generating and persisting a local one
    /// if none exists yet.
    pub async fn get_or_create(&self, address: &str) -> Result<Identity, StorageError> {
        let mut current = self.current.write().await;

        if let Some(identity) = current.as_ref() {
            return Ok(identity.clone());
        }

        let identity = Identity {
            guid: Guid::generate(),
            address: address.to_string(),
            created_at: Utc::now(),
        };
        self.store.save_identity(&identity)?;

        info!("Generated new identity {}", identity.guid);
        *current = Some(identity.clone());
        Ok(identity)
    }

    /// Persist a GUID allocated by a boot node.
    ///
    /// An already persisted identity always wins over the offered GUID.
    pub async fn adopt(&self, guid: Guid, address: &str) -> Result<Identity, StorageError> {
        let mut current = self.current.write().await;

        if let Some(identity) = current.as_ref() {
            if identity.guid != guid {
                warn!(
                    "Ignoring GUID {} offered by boot node, keeping {}",
                    guid, identity.guid
                );
            }
            return Ok(identity.clone());
        }

        let identity = Identity {
            guid,
            address: address.to_string(),
            created_at: Utc::now(),
        };
        self.store.save_identity(&identity)?;

        info!("Adopted boot-assigned identity {}", identity.guid);
        *current = Some(identity.clone());
        Ok(identity)
    }

    /// Record a new advertised address without touching the GUID.
    ///
    /// Returns `true` if the address changed.
    pub async fn update_address(&self, address: &str) -> Result<bool, StorageError> {
        let mut current = self.current.write().await;

        let Some(identity) = current.as_mut() else {
            return Ok(false);
        };

        if identity.address == address {
            return Ok(false);
        }

        let mut updated = identity.clone();
        updated.address = address.to_string();
        self.store.save_identity(&updated)?;

        info!("Address changed from {} to {}", identity.address, address);
        *identity = updated;
        Ok(true)
    }
}
