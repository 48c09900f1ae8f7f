//! Pychain membership and gossip engine
//!
//! This crate implements the core of a pychain node: a persisted identity,
//! a peer registry kept fresh by a jittered sync loop, bootstrap from boot
//! nodes, and deduplicated flood gossip. Outbound contact goes through the
//! [`PeerTransport`] trait so the engine can run over HTTP or in-process.

pub mod bootstrap;
pub mod config;
pub mod gossip;
pub mod identity;
pub mod memory;
pub mod node;
pub mod registry;
pub mod seen;
pub mod storage;
pub mod sync;
pub mod transport;

// Re-export key types
pub use bootstrap::{BootstrapConfig, BootstrapError, BootstrapOutcome, Bootstrapper};
pub use config::{ConfigError, NodeConfig};
pub use gossip::{GossipBroadcaster, GossipConfig, GossipError, ReceiveOutcome};
pub use identity::{GuidPolicy, Identity, IdentityStore};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use node::{NodeError, PychainNode};
pub use registry::{Liveness, PeerRegistry, UpsertOutcome};
pub use seen::SeenSet;
pub use storage::{NodeStore, StorageError};
pub use sync::{SyncConfig, SyncLoop, SyncReport};
pub use transport::{with_timeout, PeerTransport, TransportError, DEFAULT_PEER_TIMEOUT};
