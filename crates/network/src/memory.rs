//! In-process network.
//!
//! Nodes register under their advertised address and reach each other through
//! [`MemoryTransport`] handles by calling the target node's request handlers
//! directly. Used to run multi-node scenarios without sockets.

use async_trait::async_trait;
use pychain_protocol::{
    address_host, BroadcastAck, JoinRequest, JoinResponse, LeaveRequest, MessageEnvelope,
    StatusResponse, SyncRequest, SyncResponse,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

use crate::node::{NodeError, PychainNode};
use crate::transport::{PeerTransport, TransportError};

/// Registry of in-process nodes, keyed by address.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, Weak<PychainNode>>>,
    partitioned: RwLock<HashSet<String>>,
    /// (from, to) of every broadcast that reached a node
    broadcasts: RwLock<Vec<(String, String)>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for the node that will be reachable at `local_address`.
    pub fn connect(self: &Arc<Self>, local_address: &str) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            local_address: local_address.to_string(),
        })
    }

    pub async fn register(&self, address: &str, node: &Arc<PychainNode>) {
        self.nodes
            .write()
            .await
            .insert(address.to_string(), Arc::downgrade(node));
    }

    /// Make `address` unreachable (or reachable again) for everyone.
    pub async fn set_reachable(&self, address: &str, reachable: bool) {
        let mut partitioned = self.partitioned.write().await;
        if reachable {
            partitioned.remove(address);
        } else {
            partitioned.insert(address.to_string());
        }
    }

    /// Broadcast sends delivered so far, in order.
    pub async fn broadcast_log(&self) -> Vec<(String, String)> {
        self.broadcasts.read().await.clone()
    }

    async fn resolve(&self, address: &str) -> Result<Arc<PychainNode>, TransportError> {
        let unreachable = |reason: &str| TransportError::Unreachable {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        if self.partitioned.read().await.contains(address) {
            return Err(unreachable("partitioned"));
        }

        self.nodes
            .read()
            .await
            .get(address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| unreachable("no node listening"))
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local_address: String,
}

impl MemoryTransport {
    fn rejected(address: &str, error: NodeError) -> TransportError {
        let status = match error {
            NodeError::NotJoined => 503,
            NodeError::InvalidRequest { .. } => 400,
            NodeError::UnknownPeer { .. } => 404,
            NodeError::Config { .. } | NodeError::Storage { .. } => 500,
        };
        TransportError::Rejected {
            address: address.to_string(),
            status,
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn status(&self, address: &str) -> Result<StatusResponse, TransportError> {
        let node = self.network.resolve(address).await?;
        node.status().await.map_err(|e| Self::rejected(address, e))
    }

    async fn join(
        &self,
        address: &str,
        request: JoinRequest,
    ) -> Result<JoinResponse, TransportError> {
        let node = self.network.resolve(address).await?;
        node.handle_join(request, address_host(&self.local_address))
            .await
            .map_err(|e| Self::rejected(address, e))
    }

    async fn sync(
        &self,
        address: &str,
        request: SyncRequest,
    ) -> Result<SyncResponse, TransportError> {
        let node = self.network.resolve(address).await?;
        node.handle_sync(request)
            .await
            .map_err(|e| Self::rejected(address, e))
    }

    async fn broadcast(
        &self,
        address: &str,
        envelope: MessageEnvelope,
    ) -> Result<BroadcastAck, TransportError> {
        let node = self.network.resolve(address).await?;
        self.network
            .broadcasts
            .write()
            .await
            .push((self.local_address.clone(), address.to_string()));
        node.handle_broadcast(envelope)
            .await
            .map_err(|e| Self::rejected(address, e))
    }

    async fn leave(&self, address: &str, request: LeaveRequest) -> Result<(), TransportError> {
        let node = self.network.resolve(address).await?;
        node.handle_leave(request).await;
        Ok(())
    }

    async fn observed_host(&self, address: &str) -> Result<String, TransportError> {
        self.network.resolve(address).await?;
        Ok(address_host(&self.local_address).to_string())
    }
}
