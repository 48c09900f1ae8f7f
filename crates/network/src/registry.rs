//! Peer Registry
//!
//! The registry is the single source of truth for membership. Every mutation
//! goes through a write lock, so updates from the Sync Loop and from inbound
//! API handlers are serialized and readers only ever see whole records.
//!
//! Evicted peers leave a tombstone holding their last `last_seen`. Records
//! gossiped by other nodes are only accepted back if they are newer, so a dead
//! peer cannot be resurrected by a neighbour's stale view.

use chrono::{DateTime, Duration, Utc};
use pychain_protocol::{Guid, MembershipView, PeerRecord};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::storage::{NodeStore, StorageError};

/// Result of [`PeerRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new peer was added
    Inserted,
    /// The stored record took the incoming address/capabilities
    Updated,
    /// Incoming record carried nothing new
    Unchanged,
    /// Incoming record was older than the stored one and was ignored
    Stale,
    /// Peer was evicted and the record is no newer than the eviction
    Tombstoned,
}

/// Result of [`PeerRegistry::mark_unresponsive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The GUID is not in the registry
    Unknown,
    /// Still tracked with this many consecutive failures
    Failing(u32),
    /// Failure threshold reached; the peer was removed
    Evicted,
}

/// How long an eviction keeps out stale records of the evicted peer.
const TOMBSTONE_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    /// Newest `last_seen` of the peer when it was evicted
    last_seen: DateTime<Utc>,
    evicted_at: DateTime<Utc>,
}

/// Concurrent GUID -> PeerRecord map with optional write-through persistence.
pub struct PeerRegistry {
    peers: RwLock<HashMap<Guid, PeerRecord>>,
    /// Evicted GUID -> tombstone. Always locked after `peers`.
    tombstones: RwLock<HashMap<Guid, Tombstone>>,
    /// Consecutive failures that evict a peer
    max_failures: u32,
    store: Option<NodeStore>,
}

impl PeerRegistry {
    /// In-memory registry.
    pub fn new(max_failures: u32) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
            max_failures: max_failures.max(1),
            store: None,
        }
    }

    /// Registry persisted to the store's peer table, reloaded from it.
    pub fn with_store(max_failures: u32, store: NodeStore) -> Result<Self, StorageError> {
        let peers: HashMap<Guid, PeerRecord> = store
            .load_peers()?
            .into_iter()
            .map(|record| (record.guid.clone(), record))
            .collect();

        if !peers.is_empty() {
            info!("Loaded {} persisted peers", peers.len());
        }

        Ok(Self {
            peers: RwLock::new(peers),
            tombstones: RwLock::new(HashMap::new()),
            max_failures: max_failures.max(1),
            store: Some(store),
        })
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Insert a record or merge it into the existing one.
    ///
    /// The incoming record wins on address and capabilities only if its
    /// `last_seen` is at least as recent as the stored one. Local liveness
    /// (`failure_count`) is never taken from the incoming record. A record of
    /// an evicted peer is only accepted if it was seen after the eviction.
    pub async fn upsert(&self, record: PeerRecord) -> UpsertOutcome {
        let mut peers = self.peers.write().await;

        let Some(stored) = peers.get_mut(&record.guid) else {
            let mut tombstones = self.tombstones.write().await;
            if let Some(tombstone) = tombstones.get(&record.guid) {
                if record.last_seen <= tombstone.last_seen {
                    debug!("Ignoring stale record of evicted peer {}", record.guid);
                    return UpsertOutcome::Tombstoned;
                }
                tombstones.remove(&record.guid);
            }
            drop(tombstones);

            let record = PeerRecord {
                failure_count: 0,
                ..record
            };
            debug!("New peer {} at {}", record.guid, record.address);
            self.persist(&record);
            peers.insert(record.guid.clone(), record);
            return UpsertOutcome::Inserted;
        };

        if record.last_seen < stored.last_seen {
            return UpsertOutcome::Stale;
        }

        let mut merged = stored.clone();
        if merged.address != record.address {
            info!(
                "Peer {} moved from {} to {}",
                record.guid, merged.address, record.address
            );
            merged.address = record.address;
            merged.failure_count = 0;
        }
        merged.capabilities = record.capabilities;
        merged.last_seen = record.last_seen;

        if merged == *stored {
            return UpsertOutcome::Unchanged;
        }

        self.persist(&merged);
        *stored = merged;
        UpsertOutcome::Updated
    }

    /// Merge every record of a remote view, skipping `local`.
    ///
    /// Returns how many previously unknown peers were discovered.
    pub async fn merge_view(&self, view: MembershipView, local: &Guid) -> usize {
        let mut discovered = 0;

        for record in view {
            if &record.guid == local {
                continue;
            }

            if let Err(e) = record.validate() {
                warn!("Skipping invalid peer record {}: {}", record.guid, e);
                continue;
            }

            if self.upsert(record).await == UpsertOutcome::Inserted {
                discovered += 1;
            }
        }

        discovered
    }

    /// Record a successful contact: refresh `last_seen`, reset failures.
    pub async fn mark_responsive(&self, guid: &Guid) -> bool {
        let mut peers = self.peers.write().await;

        match peers.get_mut(guid) {
            Some(record) => {
                record.last_seen = Utc::now();
                record.failure_count = 0;
                self.persist(record);
                true
            }
            None => false,
        }
    }

    /// Record a failed contact, evicting the peer once it has failed
    /// `max_failures` consecutive times.
    pub async fn mark_unresponsive(&self, guid: &Guid) -> Liveness {
        let mut peers = self.peers.write().await;

        let Some(record) = peers.get_mut(guid) else {
            return Liveness::Unknown;
        };

        record.failure_count += 1;

        if record.failure_count >= self.max_failures {
            info!(
                "Evicting peer {} at {} after {} failures",
                guid, record.address, record.failure_count
            );
            if let Some(removed) = peers.remove(guid) {
                self.bury(&removed).await;
            }
            self.forget(guid);
            return Liveness::Evicted;
        }

        debug!("Peer {} unresponsive ({} failures)", guid, record.failure_count);
        self.persist(record);
        Liveness::Failing(record.failure_count)
    }

    /// Consistent point-in-time copy of the registry.
    pub async fn snapshot(&self) -> MembershipView {
        let peers = self.peers.read().await;
        MembershipView::new(peers.values().cloned().collect())
    }

    /// Remove a peer. Evicting an absent GUID is a no-op.
    pub async fn evict(&self, guid: &Guid) -> Option<PeerRecord> {
        let mut peers = self.peers.write().await;
        let removed = peers.remove(guid);

        if let Some(record) = &removed {
            self.bury(record).await;
            self.forget(guid);
        }

        removed
    }

    /// Whether `guid` was evicted and is still kept out.
    pub async fn is_tombstoned(&self, guid: &Guid) -> bool {
        self.tombstones.read().await.contains_key(guid)
    }

    /// Leave a tombstone for an evicted record and expire old ones.
    async fn bury(&self, record: &PeerRecord) {
        let now = Utc::now();
        let horizon = now - Duration::seconds(TOMBSTONE_TTL_SECS);
        let mut tombstones = self.tombstones.write().await;
        tombstones.retain(|_, tombstone| tombstone.evicted_at > horizon);

        let last_seen = tombstones
            .get(&record.guid)
            .map_or(record.last_seen, |t| t.last_seen.max(record.last_seen));
        tombstones.insert(
            record.guid.clone(),
            Tombstone {
                last_seen,
                evicted_at: now,
            },
        );
    }

    pub async fn get(&self, guid: &Guid) -> Option<PeerRecord> {
        self.peers.read().await.get(guid).cloned()
    }

    pub async fn contains(&self, guid: &Guid) -> bool {
        self.peers.read().await.contains_key(guid)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Up to `max` randomly chosen records.
    pub async fn sample(&self, max: usize) -> Vec<PeerRecord> {
        let mut records = self.snapshot().await.peers;
        records.shuffle(&mut rand::thread_rng());
        records.truncate(max);
        records
    }

    /// Trim the registry down to `max_peers` records.
    ///
    /// Boot nodes go first, then the least healthy peers, then the stalest.
    pub async fn enforce_limit(&self, max_peers: usize) -> Vec<PeerRecord> {
        let mut peers = self.peers.write().await;

        if peers.len() <= max_peers {
            return Vec::new();
        }

        let mut ranked: Vec<PeerRecord> = peers.values().cloned().collect();
        ranked.sort_by(|a, b| {
            b.is_boot_node()
                .cmp(&a.is_boot_node())
                .then(b.failure_count.cmp(&a.failure_count))
                .then(a.last_seen.cmp(&b.last_seen))
        });

        let excess = peers.len() - max_peers;
        let dropped: Vec<PeerRecord> = ranked.into_iter().take(excess).collect();

        for record in &dropped {
            info!("Max peer limit exceeded. Removing {} at {}", record.guid, record.address);
            peers.remove(&record.guid);
            self.forget(&record.guid);
        }

        dropped
    }

    fn persist(&self, record: &PeerRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_peer(record) {
                warn!("Failed to persist peer {}: {}", record.guid, e);
            }
        }
    }

    fn forget(&self, guid: &Guid) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove_peer(guid) {
                warn!("Failed to remove persisted peer {}: {}", guid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pychain_protocol::BOOT_NODE_CAPABILITY;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(guid: &Guid, address: &str) -> PeerRecord {
        PeerRecord::new(guid.clone(), address)
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let registry = PeerRegistry::new(3);
        let guid = Guid::generate();
        let peer = record(&guid, "10.0.0.2:8000").with_capabilities(["relay"]);

        assert_eq!(registry.upsert(peer.clone()).await, UpsertOutcome::Inserted);
        let once = registry.snapshot().await;

        assert_eq!(registry.upsert(peer).await, UpsertOutcome::Unchanged);
        assert_eq!(registry.snapshot().await, once);
    }

    #[tokio::test]
    async fn test_last_writer_by_timestamp_in_either_order() {
        let guid = Guid::generate();
        let t1 = Utc::now() - Duration::seconds(10);
        let t2 = Utc::now();
        let older = record(&guid, "10.0.0.1:8000").seen_at(t1);
        let newer = record(&guid, "10.0.0.2:8000").seen_at(t2);

        let forward = PeerRegistry::new(3);
        forward.upsert(older.clone()).await;
        forward.upsert(newer.clone()).await;

        let backward = PeerRegistry::new(3);
        backward.upsert(newer.clone()).await;
        assert_eq!(backward.upsert(older).await, UpsertOutcome::Stale);

        for registry in [forward, backward] {
            let stored = registry.get(&guid).await.unwrap();
            assert_eq!(stored.address, "10.0.0.2:8000");
            assert_eq!(stored.last_seen, t2);
        }
    }

    #[tokio::test]
    async fn test_incoming_failure_count_is_ignored() {
        let registry = PeerRegistry::new(3);
        let guid = Guid::generate();
        let mut peer = record(&guid, "10.0.0.2:8000");
        peer.failure_count = 7;

        registry.upsert(peer).await;
        assert_eq!(registry.get(&guid).await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_address_change_resets_failures() {
        let registry = PeerRegistry::new(5);
        let guid = Guid::generate();
        let earlier = Utc::now() - Duration::seconds(5);
        registry.upsert(record(&guid, "10.0.0.2:8000").seen_at(earlier)).await;
        registry.mark_unresponsive(&guid).await;

        let moved = record(&guid, "10.0.0.3:8000");
        assert_eq!(registry.upsert(moved).await, UpsertOutcome::Updated);

        let stored = registry.get(&guid).await.unwrap();
        assert_eq!(stored.address, "10.0.0.3:8000");
        assert_eq!(stored.failure_count, 0);
    }

    #[tokio::test]
    async fn test_eviction_threshold() {
        let max_failures = 3;
        let registry = PeerRegistry::new(max_failures);
        let doomed = Guid::generate();
        let survivor = Guid::generate();
        registry.upsert(record(&doomed, "10.0.0.2:8000")).await;
        registry.upsert(record(&survivor, "10.0.0.3:8000")).await;

        for i in 1..max_failures {
            assert_eq!(registry.mark_unresponsive(&doomed).await, Liveness::Failing(i));
        }
        assert_eq!(registry.mark_unresponsive(&doomed).await, Liveness::Evicted);
        assert!(!registry.snapshot().await.contains(&doomed));

        for _ in 1..max_failures {
            registry.mark_unresponsive(&survivor).await;
        }
        assert!(registry.mark_responsive(&survivor).await);

        let stored = registry.get(&survivor).await.unwrap();
        assert_eq!(stored.failure_count, 0);
    }

    #[tokio::test]
    async fn test_evict_is_idempotent() {
        let registry = PeerRegistry::new(3);
        let guid = Guid::generate();
        registry.upsert(record(&guid, "10.0.0.2:8000")).await;

        assert!(registry.evict(&guid).await.is_some());
        assert!(registry.evict(&guid).await.is_none());
        assert_eq!(registry.mark_unresponsive(&guid).await, Liveness::Unknown);
        assert!(!registry.mark_responsive(&guid).await);
    }

    #[tokio::test]
    async fn test_evicted_peer_is_not_resurrected_by_stale_views() {
        let registry = PeerRegistry::new(1);
        let local = Guid::generate();
        let dead = Guid::generate();
        let last_contact = Utc::now() - Duration::seconds(30);
        let peer = record(&dead, "10.0.0.2:8000").seen_at(last_contact);
        registry.upsert(peer.clone()).await;

        assert_eq!(registry.mark_unresponsive(&dead).await, Liveness::Evicted);
        assert!(registry.is_tombstoned(&dead).await);

        // A neighbour still gossips the record it had before the peer died.
        let view = MembershipView::new(vec![peer.clone()]);
        assert_eq!(registry.merge_view(view, &local).await, 0);
        assert_eq!(registry.upsert(peer).await, UpsertOutcome::Tombstoned);
        assert!(!registry.contains(&dead).await);

        // Contact after the eviction brings it back.
        let alive = record(&dead, "10.0.0.2:8000");
        assert_eq!(registry.upsert(alive).await, UpsertOutcome::Inserted);
        assert!(!registry.is_tombstoned(&dead).await);
    }

    #[tokio::test]
    async fn test_leave_tombstones_departed_peer() {
        let registry = PeerRegistry::new(3);
        let local = Guid::generate();
        let gone = record(&Guid::generate(), "10.0.0.2:8000");
        registry.upsert(gone.clone()).await;

        registry.evict(&gone.guid).await;

        let view = MembershipView::new(vec![gone.clone()]);
        assert_eq!(registry.merge_view(view, &local).await, 0);
        assert!(!registry.contains(&gone.guid).await);
    }

    #[tokio::test]
    async fn test_merge_view_skips_self_and_counts_discoveries() {
        let registry = PeerRegistry::new(3);
        let local = Guid::generate();
        let known = Guid::generate();
        registry.upsert(record(&known, "10.0.0.2:8000")).await;

        let view = MembershipView::new(vec![
            record(&local, "10.0.0.1:8000"),
            record(&known, "10.0.0.2:8000"),
            record(&Guid::generate(), "10.0.0.4:8000"),
            record(&Guid::generate(), "bogus"),
        ]);

        assert_eq!(registry.merge_view(view, &local).await, 1);
        assert_eq!(registry.len().await, 2);
        assert!(!registry.contains(&local).await);
    }

    #[tokio::test]
    async fn test_enforce_limit_drops_boot_nodes_first() {
        let registry = PeerRegistry::new(3);
        let boot = Guid::generate();
        let sick = Guid::generate();
        let healthy = Guid::generate();

        registry
            .upsert(record(&boot, "10.0.0.1:80").with_capabilities([BOOT_NODE_CAPABILITY]))
            .await;
        registry.upsert(record(&sick, "10.0.0.2:80")).await;
        registry.upsert(record(&healthy, "10.0.0.3:80")).await;
        registry.mark_unresponsive(&sick).await;

        assert!(registry.enforce_limit(3).await.is_empty());

        let dropped = registry.enforce_limit(1).await;
        assert_eq!(dropped.len(), 2);
        assert_eq!(dropped[0].guid, boot);
        assert_eq!(dropped[1].guid, sick);
        assert!(registry.contains(&healthy).await);
    }

    #[tokio::test]
    async fn test_sample_is_bounded() {
        let registry = PeerRegistry::new(3);
        for i in 0..10 {
            registry.upsert(record(&Guid::generate(), &format!("10.0.0.{}:80", i))).await;
        }

        assert_eq!(registry.sample(4).await.len(), 4);
        assert_eq!(registry.sample(50).await.len(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_lose_updates() {
        let registry = Arc::new(PeerRegistry::new(1000));
        let guid = Guid::generate();
        registry.upsert(record(&guid, "10.0.0.2:8000")).await;

        let mut handles = Vec::new();
        for _ in 0..50 {
            let registry = registry.clone();
            let guid = guid.clone();
            handles.push(tokio::spawn(async move {
                registry.mark_unresponsive(&guid).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.get(&guid).await.unwrap().failure_count, 50);
    }

    #[tokio::test]
    async fn test_registry_persists_through_store() {
        let temp_dir = TempDir::new().unwrap();
        let kept = Guid::generate();
        let evicted = Guid::generate();

        {
            let store = NodeStore::open(temp_dir.path()).unwrap();
            let registry = PeerRegistry::with_store(3, store).unwrap();
            registry.upsert(record(&kept, "10.0.0.2:8000")).await;
            registry.upsert(record(&evicted, "10.0.0.3:8000")).await;
            registry.mark_unresponsive(&kept).await;
            registry.evict(&evicted).await;
        }

        let store = NodeStore::open(temp_dir.path()).unwrap();
        let registry = PeerRegistry::with_store(3, store).unwrap();
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(&kept).await.unwrap().failure_count, 1);
    }
}
