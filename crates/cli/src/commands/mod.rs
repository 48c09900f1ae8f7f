//! CLI command modules

pub mod client;
pub mod node;

pub use client::{
    execute_broadcast_command, execute_peers_command, execute_status_command, BroadcastArgs,
    QueryArgs,
};
pub use node::{execute_node_command, NodeArgs};
