//! Outbound peer contact.
//!
//! The engine never talks to the network directly; it goes through a
//! [`PeerTransport`]. The HTTP adapter provides the production implementation
//! and [`crate::memory::MemoryNetwork`] an in-process one.

use async_trait::async_trait;
use pychain_protocol::{
    BroadcastAck, JoinRequest, JoinResponse, LeaveRequest, MessageEnvelope, StatusResponse,
    SyncRequest, SyncResponse,
};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Default bound on a single peer contact.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from contacting a peer. All of them count as a failed contact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer {address} did not answer within {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("Cannot reach peer {address}: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("Peer {address} rejected request with status {status}")]
    Rejected { address: String, status: u16 },

    #[error("Invalid response from peer {address}: {reason}")]
    InvalidResponse { address: String, reason: String },
}

/// Requests a node sends to other nodes, addressed by `host:port`.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// `GET /api/v1/status`
    async fn status(&self, address: &str) -> Result<StatusResponse, TransportError>;

    /// `POST /network/join`
    async fn join(&self, address: &str, request: JoinRequest)
        -> Result<JoinResponse, TransportError>;

    /// `POST /network/sync`
    async fn sync(&self, address: &str, request: SyncRequest)
        -> Result<SyncResponse, TransportError>;

    /// `POST /network/broadcast`
    async fn broadcast(
        &self,
        address: &str,
        envelope: MessageEnvelope,
    ) -> Result<BroadcastAck, TransportError>;

    /// `POST /network/leave`
    async fn leave(&self, address: &str, request: LeaveRequest) -> Result<(), TransportError>;

    /// `GET /api/v1/my-ip`: our host as the peer sees it
    async fn observed_host(&self, address: &str) -> Result<String, TransportError>;
}

/// Run a peer contact with a deadline; expiry becomes [`TransportError::Timeout`].
pub async fn with_timeout<T, F>(
    address: &str,
    timeout: Duration,
    contact: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(timeout, contact).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            address: address.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<(), _> = with_timeout("10.0.0.1:80", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(TransportError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout("10.0.0.1:80", Duration::from_secs(1), async {
            Err::<(), _>(TransportError::Rejected {
                address: "10.0.0.1:80".to_string(),
                status: 400,
            })
        })
        .await;

        assert!(matches!(result, Err(TransportError::Rejected { status: 400, .. })));
    }
}
