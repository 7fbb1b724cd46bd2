use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use stream_gate::{
    BindRequest, ByteMessage, ClientClosed, GateReq, GateResp, Gateway, GatewayConfig,
    GatewayHandler,
};
use tokio::time::interval;
use tracing::info;
use tracing_subscriber::EnvFilter;

const PUSH_MESSAGE_ID: u32 = 100;

struct LoggingHandler;

impl GatewayHandler for LoggingHandler {
    fn on_message(&self, from: &str, message: ByteMessage) {
        info!(
            from = %from,
            message_id = message.message_id,
            conn_id = message.conn_id,
            payload = %String::from_utf8_lossy(&message.data),
            "Node message"
        );
    }

    fn on_bind(&self, from: &str, request: BindRequest) {
        info!(from = %from, conn_id = request.conn_id, op = ?request.op, nodes = ?request.nodes, "Bind");
    }

    fn on_client_closed(&self, from: &str, closed: ClientClosed) {
        info!(from = %from, conn_id = closed.conn_id, "Client closed");
    }

    fn on_request(&self, request: GateReq) -> Option<GateResp> {
        info!(message_id = request.message_id, kind = %request.kind, "Unary request");
        Some(GateResp {
            message_id: request.message_id,
            data: request.data,
            ..Default::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listen = std::env::var("GATE_LISTEN").unwrap_or_else(|_| "0.0.0.0:7100".to_string());
    let gateway = Arc::new(Gateway::new(GatewayConfig::new(listen.parse()?)));

    gateway.set_handler(Arc::new(LoggingHandler));
    gateway.set_node_down_observer(Arc::new(|kind: &str, address: &str| {
        info!(kind = %kind, address = %address, "Node left");
    }));

    // Binding failures are fatal.
    let listener = gateway.bind().await?;

    let pusher = Arc::clone(&gateway);
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(3));
        let mut sequence = 0u64;
        loop {
            ticker.tick().await;
            sequence += 1;
            let message = ByteMessage::data(PUSH_MESSAGE_ID, 0, 0, format!("push #{sequence}"));
            match pusher.send_to_all(&message) {
                Ok(delivered) if delivered > 0 => info!(delivered, sequence, "Pushed to nodes"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Push failed"),
            }
        }
    });

    let shutdown = Arc::clone(&gateway);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            shutdown.quit();
        }
    });

    gateway.serve(listener).await?;
    Ok(())
}
