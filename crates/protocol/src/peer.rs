//! Node identities and membership records.
//!
//! A [`Guid`] names a node for as long as it lives; a [`PeerRecord`] is what
//! one node knows about another, and a [`MembershipView`] is the set of
//! records a node is willing to share with the rest of the network.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Capability advertised by nodes that act as boot nodes.
pub const BOOT_NODE_CAPABILITY: &str = "boot-node";

/// Maximum accepted length of a GUID string.
pub const MAX_GUID_LEN: usize = 64;

/// Globally unique identifier of a node.
///
/// GUIDs are opaque and unauthenticated: any node can claim any GUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Guid(String);

impl Guid {
    /// Generate a fresh random GUID (16 random bytes, hex encoded).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Guid(hex::encode(bytes))
    }

    /// Parse and validate a GUID string.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        if value.is_empty() || value.len() > MAX_GUID_LEN {
            return Err(ProtocolError::InvalidFormat {
                reason: format!("GUID must be 1-{} characters", MAX_GUID_LEN),
            });
        }

        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ProtocolError::InvalidFormat {
                reason: format!("GUID contains invalid characters: {}", value),
            });
        }

        Ok(Guid(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Guid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Guid::parse(s)
    }
}

impl TryFrom<String> for Guid {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Guid::parse(&value)
    }
}

impl From<Guid> for String {
    fn from(guid: Guid) -> Self {
        guid.0
    }
}

/// What a node knows about one of its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer's GUID
    pub guid: Guid,
    /// Network address (host:port)
    pub address: String,
    /// Last successful contact
    pub last_seen: DateTime<Utc>,
    /// Consecutive unresponsive contact attempts
    #[serde(default)]
    pub failure_count: u32,
    /// Advertised capabilities (unvalidated)
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl PeerRecord {
    /// Create a record for a peer contacted just now.
    pub fn new(guid: Guid, address: impl Into<String>) -> Self {
        Self {
            guid,
            address: address.into(),
            last_seen: Utc::now(),
            failure_count: 0,
            capabilities: BTreeSet::new(),
        }
    }

    /// Builder-style helper to attach capabilities.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style helper to pin the `last_seen` timestamp.
    pub fn seen_at(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        self
    }

    /// Whether the peer advertises itself as a boot node.
    pub fn is_boot_node(&self) -> bool {
        self.capabilities.contains(BOOT_NODE_CAPABILITY)
    }

    /// Check the record is usable before it enters a registry.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_address(&self.address)
    }
}

/// Point-in-time snapshot of a node's peer registry.
///
/// Order is irrelevant; at most one record per GUID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    pub peers: Vec<PeerRecord>,
}

impl MembershipView {
    pub fn new(peers: Vec<PeerRecord>) -> Self {
        Self { peers }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter()
    }

    pub fn get(&self, guid: &Guid) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| &p.guid == guid)
    }

    pub fn contains(&self, guid: &Guid) -> bool {
        self.get(guid).is_some()
    }

    /// Copy of this view without the given GUIDs.
    pub fn without(&self, excluded: &[&Guid]) -> MembershipView {
        MembershipView {
            peers: self
                .peers
                .iter()
                .filter(|p| !excluded.contains(&&p.guid))
                .cloned()
                .collect(),
        }
    }
}

impl IntoIterator for MembershipView {
    type Item = PeerRecord;
    type IntoIter = std::vec::IntoIter<PeerRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.into_iter()
    }
}

/// Validate a `host:port` peer address.
pub fn validate_address(address: &str) -> Result<(), ProtocolError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ProtocolError::InvalidFormat {
            reason: format!("Address '{}' must be host:port", address),
        })?;

    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(ProtocolError::InvalidFormat {
            reason: format!("Address '{}' has an invalid host", address),
        });
    }

    port.parse::<u16>()
        .map_err(|_| ProtocolError::InvalidFormat {
            reason: format!("Address '{}' has an invalid port", address),
        })?;

    Ok(())
}

/// Host part of a `host:port` address.
pub fn address_host(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
}

/// Replace the host part of `address`, keeping its port.
pub fn with_host(address: &str, host: &str) -> String {
    match address.rsplit_once(':') {
        Some((_, port)) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
