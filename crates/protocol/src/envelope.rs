//! Gossip message envelopes.
//!
//! An envelope is identified by `(originator, id)`. Receivers use that pair,
//! wrapped in a [`MessageKey`], to drop duplicates no matter how many peers
//! relay the same message.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::peer::{validate_address, Guid};

/// Body of a broadcast message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    /// Application payload passed through untouched
    Opaque { data: String },
    /// Named event with positional and keyword arguments
    Event {
        event: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: BTreeMap<String, Value>,
    },
}

impl MessageBody {
    pub fn opaque(data: impl Into<String>) -> Self {
        MessageBody::Opaque { data: data.into() }
    }

    pub fn event(event: impl Into<String>) -> Self {
        MessageBody::Event {
            event: event.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            MessageBody::Event { event, .. } if event.trim().is_empty() => {
                Err(ProtocolError::ValidationFailed {
                    reason: "Event name cannot be empty".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// The node a message started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Originator {
    pub guid: Guid,
    pub address: String,
}

/// Deduplication key of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub originator: Guid,
    pub id: u64,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.originator, self.id)
    }
}

/// Wire unit of gossip broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Per-originator message id, assigned when the originator first sends it
    #[serde(default)]
    pub id: Option<u64>,
    /// Node that first sent the message
    #[serde(default)]
    pub originator: Option<Originator>,
    /// Message payload
    pub body: MessageBody,
    /// When the originator sent it
    #[serde(default)]
    pub broadcast_timestamp: Option<DateTime<Utc>>,
    /// Node that handed us this copy; rewritten on every hop
    #[serde(default)]
    pub relayed_by: Option<Guid>,
}

impl MessageEnvelope {
    /// Unsent draft for a self-originated message.
    pub fn new(body: MessageBody) -> Self {
        Self {
            id: None,
            originator: None,
            body,
            broadcast_timestamp: None,
            relayed_by: None,
        }
    }

    /// Whether the envelope has not been stamped by an originator yet.
    pub fn is_draft(&self) -> bool {
        self.id.is_none() && self.originator.is_none()
    }

    /// Deduplication key, if both halves are present.
    pub fn key(&self) -> Option<MessageKey> {
        match (&self.originator, self.id) {
            (Some(originator), Some(id)) => Some(MessageKey {
                originator: originator.guid.clone(),
                id,
            }),
            _ => None,
        }
    }

    /// Validate an envelope received from the network and return its key.
    pub fn validate_inbound(&self) -> Result<MessageKey, ProtocolError> {
        let originator = self
            .originator
            .as_ref()
            .ok_or_else(|| ProtocolError::ValidationFailed {
                reason: "Envelope has no originator".to_string(),
            })?;

        let id = self.id.ok_or_else(|| ProtocolError::ValidationFailed {
            reason: "Envelope has no message id".to_string(),
        })?;

        validate_address(&originator.address)?;
        self.body.validate()?;

        Ok(MessageKey {
            originator: originator.guid.clone(),
            id,
        })
    }
}
