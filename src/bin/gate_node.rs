use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use stream_gate::{
    ByteMessage, EndpointEvent, EndpointRegistry, NodeIdentity, RegistryConfig,
};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const CAST_MESSAGE_ID: u32 = 200;
const GATE_KIND: &str = "gate";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let gate_addr = std::env::var("GATE_ADDR").unwrap_or_else(|_| "127.0.0.1:7100".to_string());
    let kind = std::env::var("NODE_KIND").unwrap_or_else(|_| "game".to_string());
    let tag = std::env::var("NODE_TAG").unwrap_or_else(|_| Uuid::new_v4().to_string());

    let (host, port) = gate_addr
        .rsplit_once(':')
        .context("GATE_ADDR must be host:port")?;
    let port: u16 = port.parse().context("GATE_ADDR port is not a number")?;

    info!(kind = %kind, tag = %tag, gate = %gate_addr, "Starting node");

    let registry = EndpointRegistry::new(NodeIdentity::new(&kind, &tag), RegistryConfig::default());
    let (tx, mut events) = mpsc::unbounded_channel();
    registry.set_observer(Arc::new(tx));
    registry.add_endpoint(GATE_KIND, host, port, [tag.as_str()])?;

    let caster = Arc::clone(&registry);
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(2));
        let mut sequence = 0u64;
        loop {
            ticker.tick().await;
            sequence += 1;
            let message = ByteMessage::data(CAST_MESSAGE_ID, 0, 0, format!("hello #{sequence}"));
            match caster.cast_by_kind(GATE_KIND, &message) {
                Ok(0) => warn!(sequence, "No gateway accepted the message"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Cast failed"),
            }
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(EndpointEvent::Message { from, message }) => info!(
                    from = %from,
                    message_id = message.message_id,
                    payload = %String::from_utf8_lossy(&message.data),
                    "Gateway message"
                ),
                Some(EndpointEvent::Control { from, event }) => info!(from = %from, event = ?event, "Gateway control"),
                Some(EndpointEvent::PeerUp { kind, address }) => info!(kind = %kind, address = %address, "Gateway up"),
                Some(EndpointEvent::PeerDown { kind, address }) => warn!(kind = %kind, address = %address, "Gateway down"),
                None => break,
            },
        }
    }

    info!("Shutting down");
    registry.quit();
    Ok(())
}
