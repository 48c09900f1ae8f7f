//! Network Sync Loop
//!
//! A long-lived task that wakes up every `interval + uniform(0, jitter)`,
//! exchanges membership views with a random sample of known peers, merges
//! what it learns and feeds every contact result into the registry's
//! liveness tracking.

use pychain_protocol::{
    with_host, JoinRequest, MembershipView, PeerRecord, SyncRequest, SyncResponse,
};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bootstrap::Bootstrapper;
use crate::identity::{Identity, IdentityStore};
use crate::registry::{Liveness, PeerRegistry};
use crate::transport::{with_timeout, PeerTransport, TransportError};

/// Configuration for the sync loop
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base sleep between cycles
    pub interval: Duration,
    /// Upper bound of the random extra sleep
    pub jitter: Duration,
    /// Bound on each peer exchange
    pub peer_timeout: Duration,
    /// Ask a peer for our address every this many cycles
    pub address_check_frequency: u64,
    /// Peers contacted per cycle
    pub max_sync_peers: usize,
    /// Registry size limit enforced after each cycle
    pub max_peers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(1),
            address_check_frequency: 25,
            max_sync_peers: 16,
            max_peers: 32,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// 1-based cycle number
    pub cycle: u64,
    /// Peers an exchange was attempted with
    pub contacted: usize,
    /// Peers that answered
    pub responsive: usize,
    /// Peers removed after reaching the failure threshold
    pub evicted: usize,
    /// Previously unknown peers learned from remote views
    pub discovered: usize,
    /// Peers dropped by the peer limit
    pub trimmed: usize,
    /// New address, if the address check found a change
    pub address_changed: Option<String>,
    /// Whether the cycle fell back to the boot nodes
    pub rebootstrapped: bool,
}

pub struct SyncLoop {
    config: SyncConfig,
    registry: Arc<PeerRegistry>,
    identity: Arc<IdentityStore>,
    transport: Arc<dyn PeerTransport>,
    bootstrapper: Arc<Bootstrapper>,
    capabilities: BTreeSet<String>,
    cycles: AtomicU64,
}

impl SyncLoop {
    pub fn new(
        config: SyncConfig,
        registry: Arc<PeerRegistry>,
        identity: Arc<IdentityStore>,
        transport: Arc<dyn PeerTransport>,
        bootstrapper: Arc<Bootstrapper>,
        capabilities: BTreeSet<String>,
    ) -> Self {
        Self {
            config,
            registry,
            identity,
            transport,
            bootstrapper,
            capabilities,
            cycles: AtomicU64::new(0),
        }
    }

    /// Sleep before the next cycle, within `[interval, interval + jitter]`.
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.interval + Duration::from_millis(extra)
    }

    /// Number of cycles run so far
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Run cycles until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting network sync every {:?} (+ up to {:?} jitter)",
            self.config.interval, self.config.jitter
        );

        loop {
            let delay = self.next_delay();
            debug!("Next network sync in {:?}", delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            if *shutdown.borrow() {
                break;
            }

            self.run_cycle().await;
        }

        info!("Network sync stopped after {} cycles", self.cycles());
    }

    /// Run one sync cycle.
    pub async fn run_cycle(&self) -> SyncReport {
        let mut report = SyncReport::default();

        let Some(identity) = self.identity.current().await else {
            warn!("Skipping network sync: node has no identity yet");
            return report;
        };

        report.cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;

        if self.registry.is_empty().await {
            info!("No peers exist, falling back to boot nodes");
            report.rebootstrapped = true;
            if let Err(e) = self.bootstrapper.bootstrap_once(self.join_request(&identity)).await {
                warn!("Unable to rejoin network: {}", e);
            }
        }

        let targets = self.registry.sample(self.config.max_sync_peers).await;
        report.contacted = targets.len();

        let request = SyncRequest {
            sender: self.local_record(&identity),
            view: self.registry.snapshot().await,
        };

        let mut exchanges = JoinSet::new();
        for target in targets {
            let transport = self.transport.clone();
            let request = request.clone();
            let timeout = self.config.peer_timeout;
            exchanges.spawn(async move {
                let result = with_timeout(
                    &target.address,
                    timeout,
                    transport.sync(&target.address, request),
                )
                .await;
                (target, result)
            });
        }

        let mut responsive = Vec::new();
        while let Some(joined) = exchanges.join_next().await {
            let (target, result) = match joined {
                Ok(exchange) => exchange,
                Err(e) => {
                    warn!("Sync task failed: {}", e);
                    continue;
                }
            };

            if self.absorb(&identity, &target, result, &mut report).await {
                responsive.push(target.address);
            }
        }
        report.responsive = responsive.len();

        if report.cycle % self.config.address_check_frequency.max(1) == 0 {
            report.address_changed = self.check_address(&identity, &responsive).await;
        }

        report.trimmed = self.registry.enforce_limit(self.config.max_peers).await.len();

        info!(
            "Network sync cycle {}: {}/{} peers responsive, {} discovered, {} evicted, {} known",
            report.cycle,
            report.responsive,
            report.contacted,
            report.discovered,
            report.evicted,
            self.registry.len().await
        );

        report
    }

    /// Apply one exchange result; returns whether the peer answered as itself.
    async fn absorb(
        &self,
        identity: &Identity,
        target: &PeerRecord,
        result: Result<SyncResponse, TransportError>,
        report: &mut SyncReport,
    ) -> bool {
        let response = match result {
            Ok(response) if response.node.guid == target.guid => response,
            Ok(response) => {
                info!(
                    "Address {} now belongs to {}, not {}",
                    target.address, response.node.guid, target.guid
                );
                let stranger = MembershipView::new(vec![response.node]);
                report.discovered += self.registry.merge_view(stranger, &identity.guid).await;
                self.record_failure(target, report).await;
                return false;
            }
            Err(e) => {
                debug!("Sync with {} failed: {}", target.address, e);
                self.record_failure(target, report).await;
                return false;
            }
        };

        self.registry.upsert(response.node).await;
        self.registry.mark_responsive(&target.guid).await;
        report.discovered += self
            .registry
            .merge_view(response.view, &identity.guid)
            .await;
        true
    }

    async fn record_failure(&self, target: &PeerRecord, report: &mut SyncReport) {
        if self.registry.mark_unresponsive(&target.guid).await == Liveness::Evicted {
            report.evicted += 1;
        }
    }

    /// Ask one responsive peer how it sees us and update our address.
    async fn check_address(&self, identity: &Identity, responsive: &[String]) -> Option<String> {
        let peer = responsive.choose(&mut rand::thread_rng())?.clone();

        let host = match with_timeout(
            &peer,
            self.config.peer_timeout,
            self.transport.observed_host(&peer),
        )
        .await
        {
            Ok(host) => host,
            Err(e) => {
                warn!("Address check with {} failed: {}", peer, e);
                return None;
            }
        };

        let address = with_host(&identity.address, &host);
        match self.identity.update_address(&address).await {
            Ok(true) => Some(address),
            Ok(false) => None,
            Err(e) => {
                warn!("Failed to persist new address {}: {}", address, e);
                None
            }
        }
    }

    fn local_record(&self, identity: &Identity) -> PeerRecord {
        PeerRecord::new(identity.guid.clone(), identity.address.clone())
            .with_capabilities(self.capabilities.iter().cloned())
    }

    fn join_request(&self, identity: &Identity) -> JoinRequest {
        JoinRequest {
            guid: Some(identity.guid.clone()),
            address: identity.address.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootstrapConfig;
    use crate::storage::NodeStore;
    use crate::transport::testing::ScriptedTransport;
    use pychain_protocol::Guid;
    use tempfile::TempDir;

    const OWN_ADDRESS: &str = "10.0.0.5:8000";

    struct Harness {
        _dir: TempDir,
        identity: Arc<IdentityStore>,
        registry: Arc<PeerRegistry>,
        transport: Arc<ScriptedTransport>,
        sync: Arc<SyncLoop>,
    }

    async fn harness(config: SyncConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = NodeStore::open(dir.path()).unwrap();
        let identity = Arc::new(IdentityStore::open(store).unwrap());
        identity.get_or_create(OWN_ADDRESS).await.unwrap();

        let registry = Arc::new(PeerRegistry::new(3));
        let transport = Arc::new(ScriptedTransport::default());
        let bootstrapper = Arc::new(Bootstrapper::new(
            BootstrapConfig::default(),
            transport.clone(),
            registry.clone(),
        ));
        let sync = Arc::new(SyncLoop::new(
            config,
            registry.clone(),
            identity.clone(),
            transport.clone(),
            bootstrapper,
            BTreeSet::new(),
        ));

        Harness {
            _dir: dir,
            identity,
            registry,
            transport,
            sync,
        }
    }

    #[tokio::test]
    async fn test_delay_stays_within_jitter_bounds() {
        let config = SyncConfig {
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(30),
            ..Default::default()
        };
        let h = harness(config).await;

        for _ in 0..1000 {
            let delay = h.sync.next_delay();
            assert!(delay >= Duration::from_secs(60));
            assert!(delay <= Duration::from_secs(90));
        }
    }

    #[tokio::test]
    async fn test_delay_without_jitter_is_the_interval() {
        let config = SyncConfig {
            interval: Duration::from_secs(5),
            jitter: Duration::ZERO,
            ..Default::default()
        };
        let h = harness(config).await;
        assert_eq!(h.sync.next_delay(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cycle_discovers_peers_transitively() {
        let h = harness(SyncConfig::default()).await;
        let own = h.identity.current().await.unwrap();

        let peer = PeerRecord::new(Guid::generate(), "10.0.0.1:80");
        let remote = PeerRecord::new(Guid::generate(), "10.0.0.2:80");
        h.registry.upsert(peer.clone()).await;
        h.transport.answer_sync(
            &peer.address,
            SyncResponse {
                node: peer.clone(),
                view: MembershipView::new(vec![
                    remote.clone(),
                    PeerRecord::new(own.guid.clone(), OWN_ADDRESS),
                ]),
            },
        );

        let report = h.sync.run_cycle().await;

        assert_eq!(report.cycle, 1);
        assert_eq!(report.contacted, 1);
        assert_eq!(report.responsive, 1);
        assert_eq!(report.discovered, 1);
        assert!(h.registry.contains(&remote.guid).await);
        assert!(!h.registry.contains(&own.guid).await);

        let syncs = h.transport.syncs.lock().unwrap();
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].1.sender.guid, own.guid);
        assert!(syncs[0].1.view.contains(&peer.guid));
    }

    #[tokio::test]
    async fn test_unresponsive_peer_is_evicted_after_max_failures() {
        let h = harness(SyncConfig::default()).await;
        let dead = PeerRecord::new(Guid::generate(), "10.0.0.66:80");
        h.registry.upsert(dead.clone()).await;

        for failures in 1..3 {
            let report = h.sync.run_cycle().await;
            assert_eq!(report.responsive, 0);
            assert_eq!(report.evicted, 0);
            assert_eq!(h.registry.get(&dead.guid).await.unwrap().failure_count, failures);
        }

        let report = h.sync.run_cycle().await;
        assert_eq!(report.evicted, 1);
        assert!(!h.registry.contains(&dead.guid).await);
    }

    #[tokio::test]
    async fn test_evicted_peer_stays_out_of_neighbour_views() {
        let h = harness(SyncConfig::default()).await;
        let live = PeerRecord::new(Guid::generate(), "10.0.0.1:80");
        let dead = PeerRecord::new(Guid::generate(), "10.0.0.66:80");
        h.registry.upsert(live.clone()).await;
        h.registry.upsert(dead.clone()).await;
        h.transport.answer_sync(
            &live.address,
            SyncResponse {
                node: live.clone(),
                view: MembershipView::new(vec![dead.clone()]),
            },
        );

        let mut evicted = 0;
        for _ in 0..3 {
            evicted += h.sync.run_cycle().await.evicted;
        }
        assert_eq!(evicted, 1);

        for _ in 0..3 {
            let report = h.sync.run_cycle().await;
            assert_eq!(report.discovered, 0);
            assert!(!h.registry.contains(&dead.guid).await);
        }
        assert!(h.registry.contains(&live.guid).await);
    }

    #[tokio::test]
    async fn test_recovered_peer_resets_failures() {
        let h = harness(SyncConfig::default()).await;
        let peer = PeerRecord::new(Guid::generate(), "10.0.0.1:80");
        h.registry.upsert(peer.clone()).await;

        h.sync.run_cycle().await;
        h.sync.run_cycle().await;
        assert_eq!(h.registry.get(&peer.guid).await.unwrap().failure_count, 2);

        h.transport.answer_sync(
            &peer.address,
            SyncResponse {
                node: peer.clone(),
                view: MembershipView::default(),
            },
        );
        h.sync.run_cycle().await;

        assert_eq!(h.registry.get(&peer.guid).await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_stranger_at_known_address_counts_as_failure() {
        let h = harness(SyncConfig::default()).await;
        let peer = PeerRecord::new(Guid::generate(), "10.0.0.1:80");
        let stranger = PeerRecord::new(Guid::generate(), "10.0.0.1:80");
        h.registry.upsert(peer.clone()).await;
        h.transport.answer_sync(
            &peer.address,
            SyncResponse {
                node: stranger.clone(),
                view: MembershipView::default(),
            },
        );

        let report = h.sync.run_cycle().await;

        assert_eq!(report.responsive, 0);
        assert!(h.registry.contains(&stranger.guid).await);
        assert_eq!(h.registry.get(&peer.guid).await.unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_address_check_updates_host_only() {
        let config = SyncConfig {
            address_check_frequency: 2,
            ..Default::default()
        };
        let h = harness(config).await;
        let guid = h.identity.guid().await.unwrap();

        let peer = PeerRecord::new(Guid::generate(), "10.0.0.1:80");
        h.registry.upsert(peer.clone()).await;
        h.transport.answer_sync(
            &peer.address,
            SyncResponse {
                node: peer.clone(),
                view: MembershipView::default(),
            },
        );
        h.transport.see_host("203.0.113.9");

        let first = h.sync.run_cycle().await;
        assert_eq!(first.address_changed, None);

        let second = h.sync.run_cycle().await;
        assert_eq!(second.address_changed.as_deref(), Some("203.0.113.9:8000"));

        let identity = h.identity.current().await.unwrap();
        assert_eq!(identity.guid, guid);
        assert_eq!(identity.address, "203.0.113.9:8000");
    }

    #[tokio::test]
    async fn test_empty_registry_falls_back_to_boot_nodes() {
        let h = harness(SyncConfig::default()).await;
        let report = h.sync.run_cycle().await;

        assert!(report.rebootstrapped);
        assert_eq!(report.contacted, 0);
    }

    #[tokio::test]
    async fn test_cycle_enforces_peer_limit() {
        let config = SyncConfig {
            max_peers: 2,
            max_sync_peers: 0,
            ..Default::default()
        };
        let h = harness(config).await;
        for i in 1..=4 {
            h.registry
                .upsert(PeerRecord::new(Guid::generate(), format!("10.0.0.{}:80", i)))
                .await;
        }

        let report = h.sync.run_cycle().await;

        assert_eq!(report.trimmed, 2);
        assert_eq!(h.registry.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let config = SyncConfig {
            interval: Duration::from_secs(10),
            jitter: Duration::ZERO,
            ..Default::default()
        };
        let h = harness(config).await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(h.sync.clone().run(rx));
        tokio::time::sleep(Duration::from_secs(35)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(h.sync.cycles(), 3);
    }
}
