//! Gossip Broadcast Module
//!
//! This module implements flood gossip with deduplication: a node sends a
//! message to every known peer, each recipient delivers it once to the
//! application and relays it to its own peers, and the [`SeenSet`] stops
//! the flood from echoing around the network.

use chrono::Utc;
use pychain_protocol::{
    DeliveryReport, Guid, MessageEnvelope, MessageKey, Originator, ProtocolError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::identity::IdentityStore;
use crate::registry::PeerRegistry;
use crate::seen::{SeenSet, DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL};
use crate::storage::{NodeStore, StorageError};
use crate::transport::{with_timeout, PeerTransport};

/// Deliveries queued for the application before new ones are dropped.
pub const DEFAULT_DELIVERY_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum GossipError {
    #[error("Invalid envelope: {source}")]
    InvalidEnvelope { source: ProtocolError },

    #[error("Node has not obtained a GUID yet")]
    NoIdentity,

    #[error("Cannot allocate message id: {source}")]
    MessageId { source: StorageError },
}

/// Configuration for gossip broadcast
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Bound on each per-peer send
    pub peer_timeout: Duration,
    /// Keys kept for deduplication
    pub seen_capacity: usize,
    /// Lifetime of a deduplication entry
    pub seen_ttl: Duration,
    /// Bound on the application delivery queue
    pub delivery_capacity: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_secs(1),
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            seen_ttl: DEFAULT_SEEN_TTL,
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
        }
    }
}

/// What happened to an inbound envelope.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// Already seen; dropped without delivery or relay
    Duplicate,
    /// Delivered to the application; relay runs in the background
    Accepted(JoinHandle<DeliveryReport>),
}

impl ReceiveOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReceiveOutcome::Accepted(_))
    }
}

/// Gossip broadcaster. Clones share all state.
#[derive(Clone)]
pub struct GossipBroadcaster {
    config: GossipConfig,
    identity: Arc<IdentityStore>,
    store: NodeStore,
    registry: Arc<PeerRegistry>,
    seen: Arc<SeenSet>,
    transport: Arc<dyn PeerTransport>,
    /// Application-layer delivery; full or closed queues drop the delivery
    deliveries: mpsc::Sender<MessageEnvelope>,
}

impl GossipBroadcaster {
    pub fn new(
        config: GossipConfig,
        identity: Arc<IdentityStore>,
        store: NodeStore,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn PeerTransport>,
        deliveries: mpsc::Sender<MessageEnvelope>,
    ) -> Self {
        let seen = Arc::new(SeenSet::new(config.seen_capacity, config.seen_ttl));
        Self {
            config,
            identity,
            store,
            registry,
            seen,
            transport,
            deliveries,
        }
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Send an envelope to every known peer.
    ///
    /// A self-originated envelope (no originator, or our own GUID) is stamped
    /// with the next local message id before it leaves. Each peer gets at most
    /// one attempt; failures are recorded, never escalated.
    pub async fn broadcast(
        &self,
        mut envelope: MessageEnvelope,
    ) -> Result<DeliveryReport, GossipError> {
        let identity = self.identity.current().await.ok_or(GossipError::NoIdentity)?;

        let self_originated = envelope
            .originator
            .as_ref()
            .map_or(true, |o| o.guid == identity.guid);

        let mut excluded = Vec::new();
        if self_originated {
            if envelope.id.is_none() {
                let id = self
                    .store
                    .next_message_id()
                    .await
                    .map_err(|source| GossipError::MessageId { source })?;
                envelope.id = Some(id);
            }
            envelope.originator = Some(Originator {
                guid: identity.guid.clone(),
                address: identity.address.clone(),
            });
            envelope.broadcast_timestamp.get_or_insert_with(Utc::now);
        } else if let Some(sender) = envelope.relayed_by.clone() {
            excluded.push(sender);
        }

        let key = envelope
            .validate_inbound()
            .map_err(|source| GossipError::InvalidEnvelope { source })?;
        excluded.push(key.originator.clone());

        // Echoes of our own message must be dropped on the way back.
        self.seen.insert(key.clone()).await;

        info!("Broadcasting message {}", key);
        Ok(self.fan_out(key, envelope, excluded).await)
    }

    /// Handle an envelope received from a peer.
    ///
    /// Duplicates are dropped silently. A novel envelope is delivered to the
    /// application once, then relayed to every peer except the one that sent
    /// it and its originator.
    pub async fn receive(&self, envelope: MessageEnvelope) -> Result<ReceiveOutcome, GossipError> {
        let key = envelope
            .validate_inbound()
            .map_err(|source| GossipError::InvalidEnvelope { source })?;

        if self.identity.guid().await.as_ref() == Some(&key.originator) {
            debug!("Dropping echo of own message {}", key);
            return Ok(ReceiveOutcome::Duplicate);
        }

        if !self.seen.insert(key.clone()).await {
            debug!("Dropping duplicate message {}", key);
            return Ok(ReceiveOutcome::Duplicate);
        }

        info!("Received message {}", key);
        match self.deliveries.try_send(envelope.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Delivery queue full, dropping message {}", key);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("No application consumer for message {}", key);
            }
        }

        let mut excluded = vec![key.originator.clone()];
        if let Some(sender) = envelope.relayed_by.clone() {
            excluded.push(sender);
        }

        let this = self.clone();
        let relay = tokio::spawn(async move { this.fan_out(key, envelope, excluded).await });
        Ok(ReceiveOutcome::Accepted(relay))
    }

    /// Send `envelope` concurrently to every registry peer not in `excluded`.
    async fn fan_out(
        &self,
        key: MessageKey,
        mut envelope: MessageEnvelope,
        excluded: Vec<Guid>,
    ) -> DeliveryReport {
        envelope.relayed_by = self.identity.guid().await;

        let targets: Vec<_> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|peer| !excluded.contains(&peer.guid))
            .collect();

        let mut report = DeliveryReport {
            key: Some(key),
            attempted: targets.len(),
            ..Default::default()
        };

        let mut sends = JoinSet::new();
        for peer in targets {
            let transport = self.transport.clone();
            let envelope = envelope.clone();
            let timeout = self.config.peer_timeout;
            sends.spawn(async move {
                let result = with_timeout(
                    &peer.address,
                    timeout,
                    transport.broadcast(&peer.address, envelope),
                )
                .await;
                (peer, result)
            });
        }

        while let Some(joined) = sends.join_next().await {
            let (peer, result) = match joined {
                Ok(send) => send,
                Err(e) => {
                    warn!("Broadcast task failed: {}", e);
                    continue;
                }
            };

            match result {
                Ok(_) => {
                    self.registry.mark_responsive(&peer.guid).await;
                    report.delivered.push(peer.guid);
                }
                Err(e) => {
                    debug!("Broadcast to {} failed: {}", peer.address, e);
                    self.registry.mark_unresponsive(&peer.guid).await;
                    report.failed.push(peer.guid);
                }
            }
        }

        debug!(
            "Broadcast {:?}: {}/{} peers reached",
            report.key,
            report.delivered.len(),
            report.attempted
        );
        report
    }
}
