//! Bootstrapper
//!
//! Turns the configured boot-node addresses into an initial registry
//! population and, when the node has no GUID yet, obtains one from the first
//! boot node that answers.

use pychain_protocol::{Guid, JoinRequest, JoinResponse};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::registry::{PeerRegistry, UpsertOutcome};
use crate::transport::{with_timeout, PeerTransport};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("None of the {attempted} selected boot nodes answered")]
    NoBootNodeReachable { attempted: usize },

    #[error("Bootstrap cancelled by shutdown")]
    Cancelled,
}

/// Configuration for bootstrapping
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Boot node addresses (host:port)
    pub boot_nodes: Vec<String>,
    /// How many boot nodes to contact per attempt
    pub max_boot_nodes: usize,
    /// Bound on each join request
    pub peer_timeout: Duration,
    /// First retry delay after every boot node failed
    pub initial_backoff: Duration,
    /// Retry delay cap
    pub max_backoff: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            boot_nodes: Vec::new(),
            max_boot_nodes: 3,
            peer_timeout: Duration::from_secs(1),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// What a successful bootstrap attempt produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapOutcome {
    /// GUID confirmed or allocated by the boot nodes (None on a seed node)
    pub guid: Option<Guid>,
    /// Our host as seen by the first boot node that answered
    pub observed_host: Option<String>,
    /// Boot nodes that answered
    pub contacted: Vec<String>,
    /// Peers added to the registry
    pub discovered: usize,
}

impl BootstrapOutcome {
    /// True when there was nobody to bootstrap from.
    pub fn is_seed(&self) -> bool {
        self.contacted.is_empty()
    }
}

pub struct Bootstrapper {
    config: BootstrapConfig,
    transport: Arc<dyn PeerTransport>,
    registry: Arc<PeerRegistry>,
    /// Boot addresses that turned out to reach this node
    own_addresses: RwLock<HashSet<String>>,
}

impl Bootstrapper {
    pub fn new(
        config: BootstrapConfig,
        transport: Arc<dyn PeerTransport>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
            own_addresses: RwLock::new(HashSet::new()),
        }
    }

    /// Random subset of at most `max_boot_nodes` boot nodes, never ourselves.
    ///
    /// Besides `own_address`, boot addresses that previously answered with
    /// our own GUID are skipped.
    pub async fn select_boot_nodes(&self, own_address: &str) -> Vec<String> {
        let own = self.own_addresses.read().await;
        let candidates: Vec<&String> = self
            .config
            .boot_nodes
            .iter()
            .filter(|a| a.as_str() != own_address && !own.contains(a.as_str()))
            .collect();

        candidates
            .choose_multiple(&mut rand::thread_rng(), self.config.max_boot_nodes)
            .map(|a| a.to_string())
            .collect()
    }

    /// Contact a random selection of boot nodes once.
    ///
    /// Unreachable boot nodes are skipped; the attempt fails only if none
    /// answers. With no boot nodes other than ourselves this is a seed node
    /// and the attempt trivially succeeds.
    pub async fn bootstrap_once(
        &self,
        request: JoinRequest,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let selected = self.select_boot_nodes(&request.address).await;

        if selected.is_empty() {
            info!("No boot nodes configured, starting as seed node");
            return Ok(BootstrapOutcome {
                guid: request.guid,
                ..Default::default()
            });
        }

        let mut outcome = BootstrapOutcome {
            guid: request.guid.clone(),
            ..Default::default()
        };
        let mut found_self = 0;

        for boot_address in &selected {
            let join = JoinRequest {
                guid: outcome.guid.clone(),
                ..request.clone()
            };

            debug!("Sending join request to {}", boot_address);
            let result = with_timeout(
                boot_address,
                self.config.peer_timeout,
                self.transport.join(boot_address, join),
            )
            .await;

            match result {
                Ok(response) if outcome.guid.as_ref() == Some(&response.node.guid) => {
                    debug!("Skipping boot node {}: found self", boot_address);
                    self.own_addresses.write().await.insert(boot_address.clone());
                    found_self += 1;
                }
                Ok(response) => {
                    self.absorb(boot_address, response, &mut outcome).await;
                    outcome.contacted.push(boot_address.clone());
                }
                Err(e) => {
                    warn!("Boot node {} unreachable: {}", boot_address, e);
                }
            }
        }

        if outcome.contacted.is_empty() {
            if found_self == selected.len() {
                info!("Every selected boot node is this node, starting as seed node");
                return Ok(BootstrapOutcome {
                    guid: request.guid,
                    ..Default::default()
                });
            }
            return Err(BootstrapError::NoBootNodeReachable {
                attempted: selected.len(),
            });
        }

        info!(
            "Bootstrapped from {} boot nodes, discovered {} peers",
            outcome.contacted.len(),
            outcome.discovered
        );
        Ok(outcome)
    }

    /// Keep calling [`Self::bootstrap_once`] with exponential backoff until
    /// a boot node answers or `shutdown` fires.
    pub async fn bootstrap(
        &self,
        request: JoinRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let mut backoff = self.config.initial_backoff;

        loop {
            if *shutdown.borrow() {
                return Err(BootstrapError::Cancelled);
            }

            match self.bootstrap_once(request.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!("Unable to join network: {}; retrying in {:?}", e, backoff);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return Err(BootstrapError::Cancelled),
            }

            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Fold one join response into the outcome and the registry.
    async fn absorb(
        &self,
        boot_address: &str,
        response: JoinResponse,
        outcome: &mut BootstrapOutcome,
    ) {
        let guid = match &outcome.guid {
            Some(guid) => {
                if guid != &response.guid {
                    warn!(
                        "Boot node {} answered with GUID {}, keeping {}",
                        boot_address, response.guid, guid
                    );
                }
                guid.clone()
            }
            None => {
                info!("Boot node {} assigned GUID {}", boot_address, response.guid);
                outcome.guid = Some(response.guid.clone());
                response.guid.clone()
            }
        };

        if outcome.observed_host.is_none() {
            outcome.observed_host = Some(response.observed_host);
        }

        match response.node.validate() {
            Ok(()) => {
                if self.registry.upsert(response.node).await == UpsertOutcome::Inserted {
                    outcome.discovered += 1;
                }
            }
            Err(e) => warn!("Boot node {} sent an invalid record: {}", boot_address, e),
        }
        outcome.discovered += self.registry.merge_view(response.view, &guid).await;
    }
}
