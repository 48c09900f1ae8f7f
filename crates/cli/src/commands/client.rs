//! Client commands: query a running node or have it originate a broadcast.

use anyhow::{bail, Context, Result};
use clap::Args;
use pychain_adapters::HttpTransport;
use pychain_network::PeerTransport;
use pychain_protocol::MessageBody;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Client-side request timeout; generous compared to peer contacts since
/// `broadcast` waits for the whole fan-out.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    /// Node address (host:port)
    #[arg(default_value = "127.0.0.1:8000")]
    pub address: String,
}

#[derive(Args, Debug, Clone)]
pub struct BroadcastArgs {
    /// Node address (host:port)
    pub address: String,
    /// Opaque payload
    #[arg(long, conflicts_with = "event", required_unless_present = "event")]
    pub data: Option<String>,
    /// Event name
    #[arg(long)]
    pub event: Option<String>,
    /// Positional event argument as JSON (repeatable)
    #[arg(long = "arg", requires = "event")]
    pub args: Vec<String>,
    /// Keyword event argument as KEY=JSON (repeatable)
    #[arg(long = "kwarg", requires = "event")]
    pub kwargs: Vec<String>,
}

impl BroadcastArgs {
    pub fn body(&self) -> Result<MessageBody> {
        if let Some(data) = &self.data {
            return Ok(MessageBody::opaque(data.clone()));
        }

        let Some(event) = &self.event else {
            bail!("Either --data or --event is required");
        };

        let args = self
            .args
            .iter()
            .map(|a| parse_json_value(a))
            .collect::<Result<Vec<_>>>()?;

        let kwargs = self
            .kwargs
            .iter()
            .map(|kv| parse_kwarg(kv))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(MessageBody::Event {
            event: event.clone(),
            args,
            kwargs,
        })
    }
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_json_value(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}

fn parse_kwarg(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Invalid keyword argument '{}'. Expected KEY=VALUE", raw))?;

    if key.is_empty() {
        bail!("Keyword argument '{}' has an empty key", raw);
    }

    Ok((key.to_string(), parse_json_value(value)?))
}

/// `pychain status`
pub async fn execute_status_command(args: QueryArgs) -> Result<()> {
    let status = HttpTransport::new(CLIENT_TIMEOUT)
        .status(&args.address)
        .await
        .with_context(|| format!("Failed to query {}", args.address))?;

    println!("📈 Node Status:");
    println!("   GUID: {}", status.guid);
    println!("   Address: {}", status.address);
    println!("   Known peers: {}", status.peer_count);
    println!("   Boot node: {}", status.is_boot_node);
    println!("   Version: {}", status.version);
    Ok(())
}

/// `pychain peers`
pub async fn execute_peers_command(args: QueryArgs) -> Result<()> {
    let view = HttpTransport::new(CLIENT_TIMEOUT)
        .peers(&args.address)
        .await
        .with_context(|| format!("Failed to query {}", args.address))?;

    println!("🤝 {} known peers:", view.len());
    for peer in view.iter() {
        println!(
            "   {}  {}  last seen {}  failures {}",
            peer.guid,
            peer.address,
            peer.last_seen.to_rfc3339(),
            peer.failure_count
        );
    }
    Ok(())
}

/// `pychain broadcast`
pub async fn execute_broadcast_command(args: BroadcastArgs) -> Result<()> {
    let body = args.body()?;
    let report = HttpTransport::new(CLIENT_TIMEOUT)
        .originate(&args.address, &body)
        .await
        .with_context(|| format!("Failed to broadcast through {}", args.address))?;

    if let Some(key) = &report.key {
        println!("📣 Broadcast {}", key);
    }
    println!(
        "   Delivered to {}/{} peers",
        report.delivered.len(),
        report.attempted
    );
    for guid in &report.failed {
        println!("   ⚠️  {} did not answer", guid);
    }
    Ok(())
}
