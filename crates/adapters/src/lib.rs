//! HTTP adapters for pychain nodes
//!
//! This crate puts a node on the network: an axum server that exposes the
//! node API, and a reqwest client that implements the engine's
//! `PeerTransport` against that API.

pub mod http_client;
pub mod http_server;

pub use http_client::HttpTransport;
pub use http_server::{router, ApiError, HttpServer, ServerConfig};
