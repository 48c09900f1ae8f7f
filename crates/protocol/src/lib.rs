//! Pychain protocol types
//!
//! This crate defines the types shared by every pychain component: node
//! identities, membership records, gossip envelopes and the request/response
//! bodies nodes exchange over the network.

pub mod envelope;
pub mod errors;
pub mod messages;
pub mod peer;

pub use envelope::{MessageBody, MessageEnvelope, MessageKey, Originator};
pub use errors::ProtocolError;
pub use messages::{
    AddressResponse, BootNodeResponse, BroadcastAck, DeliveryReport, JoinRequest, JoinResponse,
    LeaveRequest, StatusResponse, SyncRequest, SyncResponse, VersionResponse,
};
pub use peer::{
    address_host, validate_address, with_host, Guid, MembershipView, PeerRecord,
    BOOT_NODE_CAPABILITY,
};

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Version of the pychain protocol
pub const PROTOCOL_VERSION: &str = "0.1.0";
