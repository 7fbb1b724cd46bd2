use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::control::{ControlEvent, NodeIdentity};
use crate::gate_proto::gate_service_server::GateService;
use crate::gate_proto::{ByteMessage, GateReq, GateResp};
use crate::message::MessageClass;
use crate::server::handler::GatewayHandler;
use crate::server::registry::NodeRegistry;
use crate::server::session::NodeGuard;
use crate::task::spawn_supervised;

pub(crate) type HandlerSlot = Arc<OnceLock<Arc<dyn GatewayHandler>>>;

/// Lifecycle of one accepted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Registered under its address, kind and tag not yet announced.
    Registering,
    /// The node has announced itself.
    Active,
    /// The stream ended and the node was removed.
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Registering => "registering",
            StreamState::Active => "active",
            StreamState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The gRPC face of the gateway.
///
/// Every accepted stream is registered eagerly under its peer address with
/// an empty identity; the node's announce only fills in kind and tag.
#[derive(Clone)]
pub struct StreamGateway {
    registry: Arc<NodeRegistry>,
    handler: HandlerSlot,
    shutdown: CancellationToken,
    stream_buffer: usize,
}

impl StreamGateway {
    pub(crate) fn new(
        registry: Arc<NodeRegistry>,
        handler: HandlerSlot,
        shutdown: CancellationToken,
        stream_buffer: usize,
    ) -> Self {
        Self {
            registry,
            handler,
            shutdown,
            stream_buffer: stream_buffer.max(1),
        }
    }
}

#[tonic::async_trait]
impl GateService for StreamGateway {
    type BindStreamStream = Pin<Box<dyn Stream<Item = Result<ByteMessage, Status>> + Send>>;

    async fn bind_stream(
        &self,
        request: Request<Streaming<ByteMessage>>,
    ) -> Result<Response<Self::BindStreamStream>, Status> {
        let address = request
            .remote_addr()
            .ok_or_else(|| Status::failed_precondition("peer address unavailable"))?
            .to_string();
        let inbound = request.into_inner();

        let (sink, rx) = mpsc::channel(self.stream_buffer);
        let Some(session) = self
            .registry
            .register(&address, NodeIdentity::default(), sink)
            .map_err(|e| Status::invalid_argument(e.to_string()))?
        else {
            warn!(address = %address, "Rejecting second stream from the same address");
            return Err(Status::already_exists(format!(
                "a stream from {address} is already active"
            )));
        };

        debug!(address = %address, state = %StreamState::Registering, "Stream accepted");

        let guard = NodeGuard::new(session, Arc::clone(&self.registry));
        spawn_supervised(
            "node-stream-read",
            read_loop(
                guard,
                inbound,
                Arc::clone(&self.registry),
                Arc::clone(&self.handler),
                self.shutdown.clone(),
            ),
        );

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn gen_req(&self, request: Request<GateReq>) -> Result<Response<GateResp>, Status> {
        let request = request.into_inner();
        if request.data.is_empty() {
            return Err(Status::invalid_argument("request payload is empty"));
        }

        let handler = self
            .handler
            .get()
            .ok_or_else(|| Status::unimplemented("no request handler registered"))?;

        let message_id = request.message_id;
        match handler.on_request(request) {
            Some(response) => Ok(Response::new(response)),
            None => {
                debug!(message_id, "Request handler returned no response");
                Err(Status::unavailable("request handler returned no response"))
            }
        }
    }
}

async fn read_loop(
    guard: NodeGuard,
    mut inbound: Streaming<ByteMessage>,
    registry: Arc<NodeRegistry>,
    handler: HandlerSlot,
    shutdown: CancellationToken,
) {
    let address = guard.address().to_owned();
    let session = Arc::clone(guard.session());
    let mut state = StreamState::Registering;

    loop {
        // A removed node gets nothing more through to the handler, even if
        // its frames are already buffered.
        let next = tokio::select! {
            biased;
            _ = session.closed() => {
                debug!(address = %address, "Node removed, no longer reading its stream");
                break;
            }
            _ = shutdown.cancelled() => break,
            next = inbound.message() => next,
        };

        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(address = %address, "Node closed its stream");
                break;
            }
            Err(status) => {
                warn!(address = %address, error = %status, "Node stream failed");
                break;
            }
        };

        match message.class() {
            MessageClass::Data => match handler.get() {
                Some(handler) => handler.on_message(&address, message),
                None => debug!(
                    address = %address,
                    message_id = message.message_id,
                    "No handler registered, dropping message"
                ),
            },
            MessageClass::Control => {
                if let Some(next) = dispatch_control(&address, &message, &registry, &handler) {
                    if next != state {
                        info!(address = %address, from = %state, to = %next, "Stream state changed");
                        state = next;
                    }
                }
            }
        }
    }

    info!(address = %address, from = %state, to = %StreamState::Closed, "Stream state changed");
    // Dropping the guard takes the node down.
    drop(guard);
}

/// Returns the new stream state when the control event changes it.
fn dispatch_control(
    address: &str,
    message: &ByteMessage,
    registry: &NodeRegistry,
    handler: &HandlerSlot,
) -> Option<StreamState> {
    let event = match ControlEvent::decode(message) {
        Ok(event) => event,
        Err(e) => {
            warn!(address = %address, error = %e, "Dropping control message");
            return None;
        }
    };

    match event {
        ControlEvent::NodeUp(identity) => {
            if registry.announce(address, identity) {
                return Some(StreamState::Active);
            }
            warn!(address = %address, "Announce from an unregistered node");
        }
        ControlEvent::Bind(request) => match handler.get() {
            Some(handler) => handler.on_bind(address, request),
            None => debug!(address = %address, "No handler registered, dropping bind"),
        },
        ControlEvent::ClientClosed(closed) => match handler.get() {
            Some(handler) => handler.on_client_closed(address, closed),
            None => debug!(address = %address, "No handler registered, dropping close notice"),
        },
    }
    None
}
