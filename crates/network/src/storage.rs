//! Persistent Node Storage Module
//!
//! This module implements the durable state of a pychain node using sled:
//! the node's identity, its peer table and the local message-id counter.

use pychain_protocol::{Guid, PeerRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;

use crate::identity::Identity;

const IDENTITY_KEY: &str = "local";
const MESSAGE_ID_KEY: &str = "message_id";

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {source}")]
    DatabaseError { source: sled::Error },

    #[error("Serialization error: {source}")]
    SerializationError { source: serde_json::Error },

    #[error("Corrupt record under key {key}: {reason}")]
    CorruptRecord { key: String, reason: String },
}

impl From<sled::Error> for StorageError {
    fn from(source: sled::Error) -> Self {
        StorageError::DatabaseError { source }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(source: serde_json::Error) -> Self {
        StorageError::SerializationError { source }
    }
}

/// Durable node state backed by sled
///
/// Cloning is cheap: clones share the same database handle.
#[derive(Clone)]
pub struct NodeStore {
    /// Main database
    db: Db,
    /// Identity tree (single `local` record)
    identity: Tree,
    /// Peers tree (guid -> PeerRecord)
    peers: Tree,
    /// Counters tree (name -> u64)
    counters: Tree,
}

impl NodeStore {
    /// Create or open a store in the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let identity = db.open_tree("identity")?;
        let peers = db.open_tree("peers")?;
        let counters = db.open_tree("counters")?;

        Ok(NodeStore {
            db,
            identity,
            peers,
            counters,
        })
    }

    /// Load the persisted identity, if any
    pub fn load_identity(&self) -> Result<Option<Identity>, StorageError> {
        read_json(&self.identity, IDENTITY_KEY)
    }

    /// Persist the identity and flush it to disk before returning
    pub fn save_identity(&self, identity: &Identity) -> Result<(), StorageError> {
        write_json(&self.identity, IDENTITY_KEY, identity)?;
        self.db.flush()?;
        Ok(())
    }

    /// Load every persisted peer record
    pub fn load_peers(&self) -> Result<Vec<PeerRecord>, StorageError> {
        let mut peers = Vec::new();

        for result in self.peers.iter() {
            let (key, bytes) = result?;
            let record: PeerRecord =
                serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptRecord {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    reason: e.to_string(),
                })?;
            peers.push(record);
        }

        Ok(peers)
    }

    /// Insert or overwrite a peer record
    pub fn save_peer(&self, record: &PeerRecord) -> Result<(), StorageError> {
        write_json(&self.peers, record.guid.as_str(), record)
    }

    /// Remove a peer record; absent records are ignored
    pub fn remove_peer(&self, guid: &Guid) -> Result<(), StorageError> {
        self.peers.remove(guid.as_str())?;
        Ok(())
    }

    /// Atomically increment and return the local message-id counter
    ///
    /// The increment is flushed before the id is returned, so an id is never
    /// handed out twice, even across a crash.
    pub async fn next_message_id(&self) -> Result<u64, StorageError> {
        let updated = self.counters.update_and_fetch(MESSAGE_ID_KEY, |old| {
            let next = old.and_then(decode_u64).unwrap_or(0) + 1;
            Some(next.to_be_bytes().to_vec())
        })?;

        let id = updated
            .as_deref()
            .and_then(decode_u64)
            .ok_or_else(|| StorageError::CorruptRecord {
                key: MESSAGE_ID_KEY.to_string(),
                reason: "Invalid counter format".to_string(),
            })?;

        self.counters.flush_async().await?;
        Ok(id)
    }

    /// Last message id handed out (0 if none)
    pub fn message_counter(&self) -> Result<u64, StorageError> {
        Ok(self
            .counters
            .get(MESSAGE_ID_KEY)?
            .as_deref()
            .and_then(decode_u64)
            .unwrap_or(0))
    }

    /// Flush pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn read_json<T: DeserializeOwned>(tree: &Tree, key: &str) -> Result<Option<T>, StorageError> {
    match tree.get(key)? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptRecord {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn write_json<T: Serialize>(tree: &Tree, key: &str, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    tree.insert(key, bytes)?;
    Ok(())
}
