//! HTTP client.
//!
//! [`HttpTransport`] is the production [`PeerTransport`]: every call is one
//! JSON request against another node's HTTP server. The CLI uses the same
//! client for its read and broadcast commands.

use async_trait::async_trait;
use pychain_network::{PeerTransport, TransportError, DEFAULT_PEER_TIMEOUT};
use pychain_protocol::{
    AddressResponse, BroadcastAck, DeliveryReport, JoinRequest, JoinResponse, LeaveRequest,
    MembershipView, MessageBody, MessageEnvelope, StatusResponse, SyncRequest, SyncResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Reqwest-backed peer transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_TIMEOUT)
    }
}

impl HttpTransport {
    /// Client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client, timeout }
    }

    /// `http://host:port/path`; full URLs are used as the base unchanged.
    fn url(address: &str, path: &str) -> String {
        let base = address.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{}{}", base, path)
        } else {
            format!("http://{}{}", base, path)
        }
    }

    fn request_error(&self, address: &str, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                address: address.to_string(),
                timeout: self.timeout,
            }
        } else if e.is_decode() {
            TransportError::InvalidResponse {
                address: address.to_string(),
                reason: e.to_string(),
            }
        } else {
            TransportError::Unreachable {
                address: address.to_string(),
                reason: e.to_string(),
            }
        }
    }

    async fn read<T: DeserializeOwned>(
        &self,
        address: &str,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                address: address.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| self.request_error(address, e))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        address: &str,
        path: &str,
    ) -> Result<T, TransportError> {
        let url = Self::url(address, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.request_error(address, e))?;
        self.read(address, response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        address: &str,
        path: &str,
        body: &B,
    ) -> Result<T, TransportError> {
        let url = Self::url(address, path);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.request_error(address, e))?;
        self.read(address, response).await
    }

    /// `GET /api/v1/peers`
    pub async fn peers(&self, address: &str) -> Result<MembershipView, TransportError> {
        self.get_json(address, "/api/v1/peers").await
    }

    /// `POST /api/v1/broadcast`: have the node at `address` originate `body`.
    pub async fn originate(
        &self,
        address: &str,
        body: &MessageBody,
    ) -> Result<DeliveryReport, TransportError> {
        self.post_json(address, "/api/v1/broadcast", body).await
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn status(&self, address: &str) -> Result<StatusResponse, TransportError> {
        self.get_json(address, "/api/v1/status").await
    }

    async fn join(
        &self,
        address: &str,
        request: JoinRequest,
    ) -> Result<JoinResponse, TransportError> {
        self.post_json(address, "/network/join", &request).await
    }

    async fn sync(
        &self,
        address: &str,
        request: SyncRequest,
    ) -> Result<SyncResponse, TransportError> {
        self.post_json(address, "/network/sync", &request).await
    }

    async fn broadcast(
        &self,
        address: &str,
        envelope: MessageEnvelope,
    ) -> Result<BroadcastAck, TransportError> {
        self.post_json(address, "/network/broadcast", &envelope).await
    }

    async fn leave(&self, address: &str, request: LeaveRequest) -> Result<(), TransportError> {
        let _: serde_json::Value = self.post_json(address, "/network/leave", &request).await?;
        Ok(())
    }

    async fn observed_host(&self, address: &str) -> Result<String, TransportError> {
        let response: AddressResponse = self.get_json(address, "/api/v1/my-ip").await?;
        Ok(response.address)
    }
}
