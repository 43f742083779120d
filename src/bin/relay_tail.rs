//! relay-tail: relay endpoint on the terminal
//!
//! Joins the relay like any other process. Events relayed from peers are
//! printed to stdout, one JSON document per line. Lines read from stdin are
//! broadcast to the peers.
//!
//! ## Input
//! ```text
//! {"type": "chat", "text": "hi"}          -> first configured namespace
//! /admin {"type": "kick", "user": "bob"}  -> namespace /admin
//! ```
//! Lines that are not JSON are sent as a JSON string.
//!
//! ## Configuration
//! - First argument, or RELAY_CONFIG: YAML config file (optional)
//! - RELAY__STORE__URL, RELAY__STORE__HOST, ...: store overrides
//! - RELAY_LOG: log filter (default: info)

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use broadcast_relay::codec::{self, Payload};
use broadcast_relay::config::RelayConfig;
use broadcast_relay::relay::{Relay, RelayAdapter, ROOT_NAMESPACE};
use broadcast_relay::utils::bootstrap::{connect_with_retry, init_tracing, RetryPolicy};
use broadcast_relay::{DeliveryOptions, DeliveryOrigin, LocalBroadcaster};

/// Prints relayed events to stdout.
struct StdoutBroadcaster;

impl LocalBroadcaster for StdoutBroadcaster {
    fn broadcast(
        &self,
        namespace: &str,
        packet: &Payload,
        options: &DeliveryOptions,
        origin: DeliveryOrigin,
    ) {
        if origin == DeliveryOrigin::Local {
            return;
        }
        match codec::encode(packet) {
            Ok(event) => {
                let line = serde_json::json!({
                    "namespace": namespace,
                    "rooms": options.rooms,
                    "event": event,
                });
                println!("{}", line);
            }
            Err(e) => warn!(error = %e, "Failed to print relayed event"),
        }
    }
}

fn parse_line<'a>(line: &'a str, default_namespace: &'a str) -> (&'a str, Payload) {
    let (namespace, body) = match line.strip_prefix('/') {
        Some(_) => line.split_once(' ').unwrap_or((line, "")),
        None => (default_namespace, line),
    };
    let body = body.trim();
    let payload = serde_json::from_str::<Value>(body)
        .map(Payload::from)
        .unwrap_or_else(|_| Payload::from(body));
    (namespace, payload)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = RelayConfig::load(path.as_deref())?;
    let endpoint = config
        .store
        .url
        .clone()
        .unwrap_or_else(|| format!("{}:{}", config.store.host, config.store.port));

    let relay = connect_with_retry(&endpoint, RetryPolicy::default(), || {
        Relay::connect(config.clone())
    })
    .await?;

    let broadcaster: Arc<dyn LocalBroadcaster> = Arc::new(StdoutBroadcaster);
    let mut adapters: BTreeMap<String, RelayAdapter> = BTreeMap::new();
    for namespace in &relay.config().namespaces {
        let adapter = relay.adapter(namespace, Arc::clone(&broadcaster));
        adapter.ready().await.map_err(|e| e.to_string())?;
        adapters.insert(adapter.namespace().to_string(), adapter);
    }
    let default_namespace = adapters
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| ROOT_NAMESPACE.to_string());
    if adapters.is_empty() {
        let adapter = relay.adapter(&default_namespace, Arc::clone(&broadcaster));
        adapter.ready().await.map_err(|e| e.to_string())?;
        adapters.insert(default_namespace.clone(), adapter);
    }

    info!(
        origin = %relay.origin(),
        namespaces = ?adapters.keys().collect::<Vec<_>>(),
        "relay-tail started"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let (namespace, packet) = parse_line(&line, &default_namespace);
                match adapters.get(namespace) {
                    Some(adapter) => {
                        // Failures are already reported on the adapter's error channel.
                        if let Some(ticket) = adapter.broadcast(packet, DeliveryOptions::everyone(), false) {
                            let _ = ticket.outcome().await;
                        }
                    }
                    None => error!(namespace = %namespace, "No adapter for namespace"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    for adapter in adapters.values() {
        adapter.close();
    }
    info!("relay-tail stopped");
    Ok(())
}
