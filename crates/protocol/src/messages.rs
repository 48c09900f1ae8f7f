//! Request and response bodies exchanged between nodes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::envelope::MessageKey;
use crate::errors::ProtocolError;
use crate::peer::{validate_address, Guid, MembershipView, PeerRecord};

/// Liveness and identity check answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub guid: Guid,
    pub address: String,
    pub peer_count: usize,
    pub is_boot_node: bool,
    pub version: String,
}

/// Sent by a node joining through a boot node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Joiner's GUID, or `None` to ask the boot node to allocate one
    #[serde(default)]
    pub guid: Option<Guid>,
    /// Address the joiner listens on
    pub address: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl JoinRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_address(&self.address)
    }
}

/// Boot node answer to a [`JoinRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// GUID the joiner must use (echoed or freshly allocated)
    pub guid: Guid,
    /// Joiner's host as the boot node sees it
    pub observed_host: String,
    /// The boot node's own record
    pub node: PeerRecord,
    /// Boot node's membership, without the joiner
    pub view: MembershipView,
}

/// Push-pull membership exchange, sent by the Sync Loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// The sender's own record
    pub sender: PeerRecord,
    /// The sender's current membership
    pub view: MembershipView,
}

impl SyncRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.sender.validate()
    }
}

/// Answer to a [`SyncRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// The responder's own record
    pub node: PeerRecord,
    pub view: MembershipView,
}

/// Explicit departure notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub guid: Guid,
}

/// An address as seen by the responding node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressResponse {
    pub address: String,
}

/// Inbound broadcast acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastAck {
    /// `false` when the envelope was a duplicate and got dropped
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub protocol_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootNodeResponse {
    pub is_boot_node: bool,
}

/// Outcome of one broadcast fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Key of the broadcast envelope
    pub key: Option<MessageKey>,
    /// Peers a send was attempted to
    pub attempted: usize,
    /// Peers that acknowledged the envelope
    pub delivered: Vec<Guid>,
    /// Peers whose send failed or timed out
    pub failed: Vec<Guid>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
