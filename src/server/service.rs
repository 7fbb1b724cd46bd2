use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::control::{ClientClosed, ControlEvent};
use crate::error::{GatewayError, SendError};
use crate::gate_proto::ByteMessage;
use crate::gate_proto::gate_service_server::GateServiceServer;
use crate::message;
use crate::server::gateway::{HandlerSlot, StreamGateway};
use crate::server::handler::GatewayHandler;
use crate::server::observer::{ConnectionObserver, incoming};
use crate::server::registry::{NodeDownObserver, NodeRegistry};
use crate::server::session::NodeSession;

/// The registry-side service object.
///
/// Owns the [`NodeRegistry`] and hands it to the stream handler and the
/// connection observer it builds.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<NodeRegistry>,
    handler: HandlerSlot,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            registry: Arc::new(NodeRegistry::new(config.queue_capacity)),
            handler: Arc::new(OnceLock::new()),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Register the application handler. Only the first registration wins.
    pub fn set_handler(&self, handler: Arc<dyn GatewayHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    /// Register the node-down observer. Only the first registration wins.
    pub fn set_node_down_observer(&self, observer: Arc<dyn NodeDownObserver>) -> bool {
        self.registry.set_down_observer(observer)
    }

    /// The tonic service, for hosting on a router built elsewhere. Streams
    /// accepted this way are only taken down by their read loop.
    pub fn service(&self) -> GateServiceServer<StreamGateway> {
        GateServiceServer::new(StreamGateway::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.handler),
            self.shutdown.clone(),
            self.config.stream_buffer,
        ))
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        let addr = self.config.listen_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })
    }

    /// Serve on an already bound listener until [`Gateway::quit`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!(address = ?local, "Gateway listening");

        let observer = ConnectionObserver::new(Arc::clone(&self.registry));
        let shutdown = self.shutdown.clone();

        tonic::transport::Server::builder()
            .add_service(self.service())
            .serve_with_incoming_shutdown(incoming(listener, observer), async move {
                shutdown.cancelled().await
            })
            .await?;

        info!(address = ?local, "Gateway stopped");
        Ok(())
    }

    /// Send to the node at `address`.
    pub fn send_to(&self, address: &str, message: &ByteMessage) -> Result<(), SendError> {
        message::validate_data(message)?;
        self.registry
            .get_by_address(address)
            .ok_or_else(|| SendError::UnknownPeer(address.to_owned()))?
            .send_response(message)
    }

    /// Send to each listed address. Returns how many accepted the message.
    pub fn send_to_addresses<'a>(
        &self,
        addresses: impl IntoIterator<Item = &'a str>,
        message: &ByteMessage,
    ) -> Result<usize, SendError> {
        message::validate_data(message)?;
        let sessions = addresses
            .into_iter()
            .filter_map(|address| self.registry.get_by_address(address));
        Ok(deliver(sessions, message))
    }

    /// Send to every node of `kind`. Returns how many accepted the message.
    pub fn send_by_kind(&self, kind: &str, message: &ByteMessage) -> Result<usize, SendError> {
        message::validate_data(message)?;
        Ok(deliver(self.registry.sessions_of_kind(kind), message))
    }

    /// Send to the node that announced `(kind, tag)`.
    pub fn send_by_kind_tag(
        &self,
        kind: &str,
        tag: &str,
        message: &ByteMessage,
    ) -> Result<(), SendError> {
        let address = self
            .registry
            .pick_address_by_kind_tag(kind, tag)
            .ok_or_else(|| SendError::UnknownPeer(format!("{kind}/{tag}")))?;
        self.send_to(&address, message)
    }

    /// Send to every node. Returns how many accepted the message.
    pub fn send_to_all(&self, message: &ByteMessage) -> Result<usize, SendError> {
        message::validate_data(message)?;
        Ok(deliver(self.registry.sessions(), message))
    }

    /// Tell every node that an end-user connection closed.
    pub fn notify_client_closed(&self, conn_id: u32, player_id: i64) -> Result<usize, SendError> {
        let message = ControlEvent::ClientClosed(ClientClosed { conn_id, player_id }).to_message()?;
        Ok(deliver(self.registry.sessions(), &message))
    }

    /// Stop serving and drop every node.
    pub fn quit(&self) {
        self.shutdown.cancel();
        self.registry.quit();
    }
}

fn deliver(sessions: impl IntoIterator<Item = Arc<NodeSession>>, message: &ByteMessage) -> usize {
    let mut delivered = 0;
    for session in sessions {
        match session.send_response(message) {
            Ok(()) => delivered += 1,
            Err(e) => debug!(
                address = %session.remote_address(),
                error = %e,
                "Dropping message for node"
            ),
        }
    }
    delivered
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::NodeIdentity;
    use crate::message::MESSAGE_ID_CLIENT_CLOSED;
    use tokio::sync::mpsc;

    type NodeRx = mpsc::Receiver<Result<ByteMessage, tonic::Status>>;

    fn join(gateway: &Gateway, address: &str, kind: &str, tag: &str) -> NodeRx {
        let (sink, rx) = mpsc::channel(8);
        gateway
            .registry()
            .node_up(address, NodeIdentity::new(kind, tag), sink)
            .unwrap();
        rx
    }

    async fn next_id(rx: &mut NodeRx) -> u32 {
        rx.recv().await.unwrap().unwrap().message_id
    }

    fn data(id: u32) -> ByteMessage {
        ByteMessage::data(id, 1, 1, b"payload".to_vec())
    }

    #[tokio::test]
    async fn test_send_by_kind_reaches_only_that_kind() {
        let gateway = Gateway::new(GatewayConfig::default());
        let mut a = join(&gateway, "a:1", "game", "a");
        let mut b = join(&gateway, "b:1", "game", "b");
        let mut c = join(&gateway, "c:1", "chat", "c");

        assert_eq!(gateway.send_by_kind("game", &data(30)).unwrap(), 2);
        gateway.send_to("c:1", &data(31)).unwrap();

        assert_eq!(next_id(&mut a).await, 30);
        assert_eq!(next_id(&mut b).await, 30);
        assert_eq!(next_id(&mut c).await, 31);
    }

    #[tokio::test]
    async fn test_send_by_kind_tag() {
        let gateway = Gateway::new(GatewayConfig::default());
        let mut a = join(&gateway, "a:1", "game", "a");
        let _b = join(&gateway, "b:1", "game", "b");

        gateway.send_by_kind_tag("game", "a", &data(40)).unwrap();
        assert_eq!(next_id(&mut a).await, 40);

        assert!(matches!(
            gateway.send_by_kind_tag("game", "zzz", &data(40)),
            Err(SendError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_send_to_unknown_and_reserved() {
        let gateway = Gateway::new(GatewayConfig::default());
        let _a = join(&gateway, "a:1", "game", "a");

        assert!(matches!(
            gateway.send_to("nope:1", &data(30)),
            Err(SendError::UnknownPeer(_))
        ));
        assert!(matches!(
            gateway.send_to_all(&data(3)),
            Err(SendError::ReservedMessageId(3))
        ));
    }

    #[tokio::test]
    async fn test_send_to_addresses_skips_unknown() {
        let gateway = Gateway::new(GatewayConfig::default());
        let mut a = join(&gateway, "a:1", "game", "a");

        let sent = gateway
            .send_to_addresses(["a:1", "missing:1"], &data(50))
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(next_id(&mut a).await, 50);
    }

    #[tokio::test]
    async fn test_notify_client_closed_is_control() {
        let gateway = Gateway::new(GatewayConfig::default());
        let mut a = join(&gateway, "a:1", "game", "a");

        assert_eq!(gateway.notify_client_closed(9, 77).unwrap(), 1);
        let message = a.recv().await.unwrap().unwrap();
        assert_eq!(message.message_id, MESSAGE_ID_CLIENT_CLOSED);
        assert_eq!(
            ControlEvent::decode(&message).unwrap(),
            ControlEvent::ClientClosed(ClientClosed {
                conn_id: 9,
                player_id: 77
            })
        );
    }

    #[tokio::test]
    async fn test_quit_closes_node_streams() {
        let gateway = Gateway::new(GatewayConfig::default());
        let mut a = join(&gateway, "a:1", "game", "a");

        gateway.quit();
        gateway.quit();

        assert!(a.recv().await.is_none());
        assert!(gateway.registry().is_empty());
        assert_eq!(gateway.send_to_all(&data(30)).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bind_reports_address_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let gateway = Gateway::new(GatewayConfig::new(addr));
        assert!(matches!(
            gateway.bind().await,
            Err(GatewayError::Bind { addr: a, .. }) if a == addr
        ));
    }
}
