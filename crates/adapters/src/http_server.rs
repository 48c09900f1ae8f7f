//! HTTP server.
//!
//! Serves the node API over axum: the `/api/v1/*` read endpoints for clients
//! and the `/network/*` endpoints other nodes call.

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pychain_network::{NodeError, PychainNode};
use pychain_protocol::{
    AddressResponse, BootNodeResponse, BroadcastAck, DeliveryReport, Guid, JoinRequest,
    JoinResponse, LeaveRequest, MembershipView, MessageBody, MessageEnvelope, StatusResponse,
    SyncRequest, SyncResponse, VersionResponse,
};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

/// [`NodeError`] as an HTTP response.
#[derive(Debug)]
pub struct ApiError(NodeError);

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NodeError::NotJoined => StatusCode::SERVICE_UNAVAILABLE,
            NodeError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            NodeError::UnknownPeer { .. } => StatusCode::NOT_FOUND,
            NodeError::Config { .. } | NodeError::Storage { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// HTTP front end of a node.
pub struct HttpServer {
    config: ServerConfig,
    node: Arc<PychainNode>,
}

impl HttpServer {
    pub fn new(config: ServerConfig, node: Arc<PychainNode>) -> Self {
        Self { config, node }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Router with every endpoint, bound to this server's node.
    pub fn router(&self) -> Router {
        router(self.node.clone())
    }

    /// Bind the listen address and serve until `shutdown` completes.
    pub async fn run<F>(&self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("HTTP server listening on {}", listener.local_addr()?);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }
}

/// Build the node API router.
///
/// Handlers that need the caller's address read [`ConnectInfo`], so the
/// router must be served with `into_make_service_with_connect_info`.
pub fn router(node: Arc<PychainNode>) -> Router {
    Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/peers", get(peers))
        .route("/api/v1/my-ip", get(my_ip))
        .route("/api/v1/version", get(version))
        .route("/api/v1/is-boot-node", get(is_boot_node))
        .route("/api/v1/nodes/:guid", get(lookup))
        .route("/api/v1/broadcast", post(originate))
        .route("/network/join", post(join))
        .route("/network/sync", post(sync))
        .route("/network/broadcast", post(broadcast))
        .route("/network/leave", post(leave))
        .with_state(node)
}

async fn status(State(node): State<Arc<PychainNode>>) -> ApiResult<StatusResponse> {
    Ok(Json(node.status().await?))
}

async fn peers(State(node): State<Arc<PychainNode>>) -> Json<MembershipView> {
    Json(node.peers().await)
}

async fn my_ip(ConnectInfo(remote): ConnectInfo<SocketAddr>) -> Json<AddressResponse> {
    Json(AddressResponse {
        address: remote.ip().to_string(),
    })
}

async fn version(State(node): State<Arc<PychainNode>>) -> Json<VersionResponse> {
    Json(node.version())
}

async fn is_boot_node(State(node): State<Arc<PychainNode>>) -> Json<BootNodeResponse> {
    Json(BootNodeResponse {
        is_boot_node: node.is_boot_node(),
    })
}

async fn lookup(
    State(node): State<Arc<PychainNode>>,
    Path(guid): Path<String>,
) -> ApiResult<AddressResponse> {
    let guid = Guid::parse(&guid).map_err(|source| NodeError::InvalidRequest { source })?;
    let address = node.lookup(&guid).await?;
    Ok(Json(AddressResponse { address }))
}

async fn originate(
    State(node): State<Arc<PychainNode>>,
    Json(body): Json<MessageBody>,
) -> ApiResult<DeliveryReport> {
    Ok(Json(node.originate(body).await?))
}

async fn join(
    State(node): State<Arc<PychainNode>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(request): Json<JoinRequest>,
) -> ApiResult<JoinResponse> {
    let remote_host = remote.ip().to_string();
    Ok(Json(node.handle_join(request, &remote_host).await?))
}

async fn sync(
    State(node): State<Arc<PychainNode>>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<SyncResponse> {
    Ok(Json(node.handle_sync(request).await?))
}

async fn broadcast(
    State(node): State<Arc<PychainNode>>,
    Json(envelope): Json<MessageEnvelope>,
) -> ApiResult<BroadcastAck> {
    Ok(Json(node.handle_broadcast(envelope).await?))
}

async fn leave(
    State(node): State<Arc<PychainNode>>,
    Json(request): Json<LeaveRequest>,
) -> Json<serde_json::Value> {
    node.handle_leave(request).await;
    Json(json!({}))
}
