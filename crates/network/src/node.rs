//! Node Management Module
//!
//! [`PychainNode`] wires the engine together: it owns storage, identity, the
//! peer registry and the gossip broadcaster, runs bootstrap and the sync loop
//! in the background, and exposes one handler per inbound request for the
//! serving layer to call.

use pychain_protocol::{
    with_host, BroadcastAck, DeliveryReport, Guid, JoinRequest, JoinResponse, LeaveRequest,
    MembershipView, MessageBody, MessageEnvelope, PeerRecord, ProtocolError, StatusResponse,
    SyncRequest, SyncResponse, VersionResponse, PROTOCOL_VERSION,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::bootstrap::{BootstrapError, Bootstrapper};
use crate::config::{ConfigError, NodeConfig};
use crate::gossip::{GossipBroadcaster, GossipError};
use crate::identity::{GuidPolicy, Identity, IdentityStore};
use crate::registry::PeerRegistry;
use crate::storage::{NodeStore, StorageError};
use crate::sync::SyncLoop;
use crate::transport::{with_timeout, PeerTransport};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Invalid configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },

    #[error("Node has not joined the network yet")]
    NotJoined,

    #[error("Invalid request: {source}")]
    InvalidRequest { source: ProtocolError },

    #[error("Unknown peer {guid}")]
    UnknownPeer { guid: Guid },
}

impl From<GossipError> for NodeError {
    fn from(e: GossipError) -> Self {
        match e {
            GossipError::InvalidEnvelope { source } => NodeError::InvalidRequest { source },
            GossipError::NoIdentity => NodeError::NotJoined,
            GossipError::MessageId { source } => NodeError::Storage { source },
        }
    }
}

/// A pychain network node
pub struct PychainNode {
    config: NodeConfig,
    store: NodeStore,
    identity: Arc<IdentityStore>,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
    bootstrapper: Arc<Bootstrapper>,
    sync: Arc<SyncLoop>,
    gossip: GossipBroadcaster,
    /// Application deliveries, until someone takes them
    messages: Mutex<Option<mpsc::Receiver<MessageEnvelope>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PychainNode {
    /// Open storage and build the engine. Nothing touches the network yet.
    ///
    /// Fails if the configuration is invalid or the storage directory cannot
    /// be opened; a node must not run without durable identity storage.
    pub fn open(config: NodeConfig, transport: Arc<dyn PeerTransport>) -> Result<Self, NodeError> {
        config.validate()?;

        let store = NodeStore::open(&config.storage_dir)?;
        let identity = Arc::new(IdentityStore::open(store.clone())?);
        let registry = Arc::new(PeerRegistry::with_store(config.max_failures, store.clone())?);

        let bootstrapper = Arc::new(Bootstrapper::new(
            config.bootstrap_config(),
            transport.clone(),
            registry.clone(),
        ));
        let sync = Arc::new(SyncLoop::new(
            config.sync_config(),
            registry.clone(),
            identity.clone(),
            transport.clone(),
            bootstrapper.clone(),
            config.advertised_capabilities(),
        ));

        let gossip_config = config.gossip_config();
        let (deliveries, messages) = mpsc::channel(gossip_config.delivery_capacity);
        let gossip = GossipBroadcaster::new(
            gossip_config,
            identity.clone(),
            store.clone(),
            registry.clone(),
            transport.clone(),
            deliveries,
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            identity,
            registry,
            transport,
            bootstrapper,
            sync,
            gossip,
            messages: Mutex::new(Some(messages)),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.identity
    }

    pub fn sync_loop(&self) -> &Arc<SyncLoop> {
        &self.sync
    }

    pub fn is_boot_node(&self) -> bool {
        self.config.is_boot_node
    }

    /// Receiver of envelopes delivered to the application. Only the first
    /// caller gets it; while nobody holds it, deliveries beyond the queue
    /// capacity are dropped.
    pub async fn take_messages(&self) -> Option<mpsc::Receiver<MessageEnvelope>> {
        self.messages.lock().await.take()
    }

    /// Join the network in the background, then keep membership in sync
    /// until [`Self::shutdown`].
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("Node already started");
            return;
        }

        info!("Starting pychain node on {}", self.config.listen_addr);
        let node = self.clone();
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move { node.run(shutdown).await }));
    }

    /// Establish identity and bootstrap; returns `None` if the node must not
    /// proceed (shutdown or identity persistence failure).
    pub async fn join_network(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Identity> {
        let mut address = match (&self.config.advertise_address, self.identity.current().await) {
            (Some(address), _) => address.clone(),
            (None, Some(identity)) => identity.address,
            (None, None) => self.config.initial_address(),
        };

        // Boot nodes allocate their own GUID.
        if self.config.guid_policy == GuidPolicy::Local || self.config.is_boot_node {
            if let Err(e) = self.identity.get_or_create(&address).await {
                error!("Cannot persist node identity: {}", e);
                return None;
            }
        }

        let request = JoinRequest {
            guid: self.identity.guid().await,
            address: address.clone(),
            capabilities: self.config.advertised_capabilities(),
        };

        let outcome = match self.bootstrapper.bootstrap(request, shutdown).await {
            Ok(outcome) => outcome,
            Err(BootstrapError::Cancelled) => return None,
            Err(e) => {
                error!("Bootstrap failed: {}", e);
                return None;
            }
        };

        if self.config.advertise_address.is_none() {
            if let Some(host) = &outcome.observed_host {
                address = with_host(&address, host);
            }
        }

        let persisted = match (self.identity.current().await, outcome.guid) {
            (Some(_), _) => self.identity.update_address(&address).await.map(|_| ()),
            (None, Some(guid)) => self.identity.adopt(guid, &address).await.map(|_| ()),
            (None, None) => self.identity.get_or_create(&address).await.map(|_| ()),
        };

        if let Err(e) = persisted {
            error!("Cannot persist node identity: {}", e);
            return None;
        }

        let identity = self.identity.current().await?;
        info!("Joined network as {} at {}", identity.guid, identity.address);
        Some(identity)
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.join_network(&mut shutdown).await.is_none() {
            info!("Node stopped before joining the network");
            return;
        }

        self.sync.clone().run(shutdown).await;
    }

    /// Announce departure to every known peer, stop background work and
    /// flush storage.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        info!("Shutting down pychain node");

        if let Some(guid) = self.identity.guid().await {
            self.announce_leave(guid).await;
        }

        self.shutdown.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.store.flush()?;
        info!("Node shutdown complete");
        Ok(())
    }

    async fn announce_leave(&self, guid: Guid) {
        let mut leaves = JoinSet::new();
        for peer in self.registry.snapshot().await {
            let transport = self.transport.clone();
            let request = LeaveRequest { guid: guid.clone() };
            let timeout = self.config.peer_timeout();
            leaves.spawn(async move {
                let result = with_timeout(
                    &peer.address,
                    timeout,
                    transport.leave(&peer.address, request),
                )
                .await;
                (peer.address, result)
            });
        }

        while let Some(Ok((address, result))) = leaves.join_next().await {
            if let Err(e) = result {
                debug!("Leave notice to {} failed: {}", address, e);
            }
        }
    }

    async fn require_identity(&self) -> Result<Identity, NodeError> {
        self.identity.current().await.ok_or(NodeError::NotJoined)
    }

    fn local_record(&self, identity: &Identity) -> PeerRecord {
        PeerRecord::new(identity.guid.clone(), identity.address.clone())
            .with_capabilities(self.config.advertised_capabilities())
    }

    /// `GET /api/v1/status`
    pub async fn status(&self) -> Result<StatusResponse, NodeError> {
        let identity = self.require_identity().await?;
        Ok(StatusResponse {
            guid: identity.guid,
            address: identity.address,
            peer_count: self.registry.len().await,
            is_boot_node: self.config.is_boot_node,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// `GET /api/v1/peers`
    pub async fn peers(&self) -> MembershipView {
        self.registry.snapshot().await
    }

    /// `GET /api/v1/version`
    pub fn version(&self) -> VersionResponse {
        VersionResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// `GET /api/v1/nodes/{guid}`: address of a known node.
    pub async fn lookup(&self, guid: &Guid) -> Result<String, NodeError> {
        if let Some(identity) = self.identity.current().await {
            if &identity.guid == guid {
                return Ok(identity.address);
            }
        }

        self.registry
            .get(guid)
            .await
            .map(|record| record.address)
            .ok_or_else(|| NodeError::UnknownPeer { guid: guid.clone() })
    }

    /// `POST /network/join`
    ///
    /// `remote_host` is the joiner's host as seen by the serving layer.
    pub async fn handle_join(
        &self,
        request: JoinRequest,
        remote_host: &str,
    ) -> Result<JoinResponse, NodeError> {
        let identity = self.require_identity().await?;
        request
            .validate()
            .map_err(|source| NodeError::InvalidRequest { source })?;

        let guid = match request.guid {
            Some(guid) => guid,
            None => self.allocate_guid(&identity.guid).await,
        };

        if guid == identity.guid {
            debug!("Ignoring join from own GUID");
        } else {
            info!("Peer {} joined from {}", guid, request.address);
            let record = PeerRecord::new(guid.clone(), request.address)
                .with_capabilities(request.capabilities);
            self.registry.upsert(record).await;
        }

        let view = self.registry.snapshot().await.without(&[&guid]);
        Ok(JoinResponse {
            guid,
            observed_host: remote_host.to_string(),
            node: self.local_record(&identity),
            view,
        })
    }

    /// A GUID that is neither ours nor in the registry.
    async fn allocate_guid(&self, own: &Guid) -> Guid {
        loop {
            let guid = Guid::generate();
            if &guid != own && !self.registry.contains(&guid).await {
                return guid;
            }
        }
    }

    /// `POST /network/sync`
    pub async fn handle_sync(&self, request: SyncRequest) -> Result<SyncResponse, NodeError> {
        let identity = self.require_identity().await?;
        request
            .validate()
            .map_err(|source| NodeError::InvalidRequest { source })?;

        let sender = request.sender.guid.clone();
        if sender != identity.guid {
            self.registry.upsert(request.sender).await;
            self.registry.mark_responsive(&sender).await;
        }
        let discovered = self.registry.merge_view(request.view, &identity.guid).await;
        if discovered > 0 {
            debug!("Sync from {} revealed {} new peers", sender, discovered);
        }

        Ok(SyncResponse {
            node: self.local_record(&identity),
            view: self.registry.snapshot().await.without(&[&sender]),
        })
    }

    /// `POST /network/broadcast`
    pub async fn handle_broadcast(
        &self,
        envelope: MessageEnvelope,
    ) -> Result<BroadcastAck, NodeError> {
        let outcome = self.gossip.receive(envelope).await?;
        Ok(BroadcastAck {
            accepted: outcome.is_accepted(),
        })
    }

    /// `POST /network/leave`
    pub async fn handle_leave(&self, request: LeaveRequest) {
        if self.registry.evict(&request.guid).await.is_some() {
            info!("Peer {} left the network", request.guid);
        }
    }

    /// `POST /api/v1/broadcast`: originate a message at this node.
    pub async fn originate(&self, body: MessageBody) -> Result<DeliveryReport, NodeError> {
        Ok(self.gossip.broadcast(MessageEnvelope::new(body)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedTransport;
    use pychain_protocol::BOOT_NODE_CAPABILITY;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> NodeConfig {
        NodeConfig {
            storage_dir: dir.path().join("db"),
            advertise_address: Some("10.0.0.1:8000".to_string()),
            is_boot_node: true,
            ..Default::default()
        }
    }

    async fn seed_node(dir: &TempDir) -> (Arc<PychainNode>, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::default());
        let node = Arc::new(PychainNode::open(config(dir), transport.clone()).unwrap());
        let (_tx, mut rx) = watch::channel(false);
        node.join_network(&mut rx).await.unwrap();
        (node, transport)
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = NodeConfig {
            boot_nodes: vec!["not an address".to_string()],
            ..config(&dir)
        };

        let result = PychainNode::open(config, Arc::new(ScriptedTransport::default()));
        assert!(matches!(result, Err(NodeError::Config { .. })));
    }

    #[tokio::test]
    async fn test_open_fails_without_storage() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"not a directory").unwrap();
        let config = NodeConfig {
            storage_dir: file,
            ..config(&dir)
        };

        let result = PychainNode::open(config, Arc::new(ScriptedTransport::default()));
        assert!(matches!(result, Err(NodeError::Storage { .. })));
    }

    #[tokio::test]
    async fn test_requests_before_identity_are_refused() {
        let dir = TempDir::new().unwrap();
        let node =
            PychainNode::open(config(&dir), Arc::new(ScriptedTransport::default())).unwrap();

        assert!(matches!(node.status().await, Err(NodeError::NotJoined)));
        let join = JoinRequest {
            guid: None,
            address: "10.0.0.2:8000".to_string(),
            capabilities: Default::default(),
        };
        assert!(matches!(
            node.handle_join(join, "10.0.0.2").await,
            Err(NodeError::NotJoined)
        ));
    }

    #[tokio::test]
    async fn test_seed_node_generates_identity() {
        let dir = TempDir::new().unwrap();
        let (node, _) = seed_node(&dir).await;

        let status = node.status().await.unwrap();
        assert_eq!(status.address, "10.0.0.1:8000");
        assert_eq!(status.peer_count, 0);
        assert!(status.is_boot_node);
    }

    #[tokio::test]
    async fn test_identity_survives_restart() {
        let dir = TempDir::new().unwrap();
        let first = {
            let (node, _) = seed_node(&dir).await;
            let guid = node.identity().guid().await.unwrap();
            node.shutdown().await.unwrap();
            guid
        };

        let (node, _) = seed_node(&dir).await;
        assert_eq!(node.identity().guid().await, Some(first));
    }

    #[tokio::test]
    async fn test_join_allocates_unique_guid() {
        let dir = TempDir::new().unwrap();
        let (node, _) = seed_node(&dir).await;

        let response = node
            .handle_join(
                JoinRequest {
                    guid: None,
                    address: "10.0.0.2:8000".to_string(),
                    capabilities: Default::default(),
                },
                "10.0.0.2",
            )
            .await
            .unwrap();

        assert_eq!(response.observed_host, "10.0.0.2");
        assert!(response.node.capabilities.contains(BOOT_NODE_CAPABILITY));
        assert!(!response.view.contains(&response.guid));
        assert_eq!(
            node.lookup(&response.guid).await.unwrap(),
            "10.0.0.2:8000".to_string()
        );
    }

    #[tokio::test]
    async fn test_join_with_own_guid_is_ignored() {
        let dir = TempDir::new().unwrap();
        let (node, _) = seed_node(&dir).await;
        let own = node.identity().guid().await.unwrap();

        node.handle_join(
            JoinRequest {
                guid: Some(own),
                address: "10.0.0.9:8000".to_string(),
                capabilities: Default::default(),
            },
            "10.0.0.9",
        )
        .await
        .unwrap();

        assert!(node.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_join_rejects_bad_address() {
        let dir = TempDir::new().unwrap();
        let (node, _) = seed_node(&dir).await;

        let result = node
            .handle_join(
                JoinRequest {
                    guid: None,
                    address: "no-port".to_string(),
                    capabilities: Default::default(),
                },
                "10.0.0.2",
            )
            .await;
        assert!(matches!(result, Err(NodeError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_sync_merges_sender_and_view() {
        let dir = TempDir::new().unwrap();
        let (node, _) = seed_node(&dir).await;

        let sender = PeerRecord::new(Guid::generate(), "10.0.0.2:8000");
        let known = PeerRecord::new(Guid::generate(), "10.0.0.3:8000");
        let response = node
            .handle_sync(SyncRequest {
                sender: sender.clone(),
                view: MembershipView::new(vec![known.clone()]),
            })
            .await
            .unwrap();

        assert_eq!(node.registry().len().await, 2);
        assert!(response.view.contains(&known.guid));
        assert!(!response.view.contains(&sender.guid));
        assert_eq!(Some(response.node.guid), node.identity().guid().await);
    }

    #[tokio::test]
    async fn test_leave_evicts_peer() {
        let dir = TempDir::new().unwrap();
        let (node, _) = seed_node(&dir).await;
        let peer = PeerRecord::new(Guid::generate(), "10.0.0.2:8000");
        node.registry().upsert(peer.clone()).await;

        node.handle_leave(LeaveRequest { guid: peer.guid.clone() }).await;
        node.handle_leave(LeaveRequest { guid: peer.guid.clone() }).await;

        assert!(matches!(
            node.lookup(&peer.guid).await,
            Err(NodeError::UnknownPeer { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_sends_leave_to_peers() {
        let dir = TempDir::new().unwrap();
        let (node, transport) = seed_node(&dir).await;
        node.registry()
            .upsert(PeerRecord::new(Guid::generate(), "10.0.0.2:8000"))
            .await;
        node.registry()
            .upsert(PeerRecord::new(Guid::generate(), "10.0.0.3:8000"))
            .await;

        node.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        node.shutdown().await.unwrap();

        let own = node.identity().guid().await.unwrap();
        let leaves = transport.leaves.lock().unwrap();
        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|(_, request)| request.guid == own));
    }

    #[tokio::test]
    async fn test_originate_and_receive() {
        let dir = TempDir::new().unwrap();
        let (node, transport) = seed_node(&dir).await;
        let peer = PeerRecord::new(Guid::generate(), "10.0.0.2:8000");
        node.registry().upsert(peer.clone()).await;
        transport.accept_broadcasts(&peer.address);

        let report = node.originate(MessageBody::opaque("hello")).await.unwrap();
        assert_eq!(report.delivered, vec![peer.guid.clone()]);

        let mut messages = node.take_messages().await.unwrap();
        assert!(node.take_messages().await.is_none());

        let mut inbound = MessageEnvelope::new(MessageBody::opaque("hi"));
        inbound.id = Some(1);
        inbound.originator = Some(pychain_protocol::Originator {
            guid: peer.guid.clone(),
            address: peer.address.clone(),
        });

        assert!(node.handle_broadcast(inbound.clone()).await.unwrap().accepted);
        assert!(!node.handle_broadcast(inbound).await.unwrap().accepted);
        assert_eq!(messages.recv().await.unwrap().body, MessageBody::opaque("hi"));
    }
}
