use std::fmt;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, warn};

use crate::control::NodeIdentity;
use crate::error::SendError;
use crate::gate_proto::ByteMessage;
use crate::message;
use crate::server::registry::NodeRegistry;
use crate::task::spawn_supervised;

/// The write half of an accepted stream. Whatever is sent here is written to
/// the node by tonic.
pub type StreamSink = mpsc::Sender<Result<ByteMessage, Status>>;

/// One connected backend node.
///
/// All outbound traffic goes through a bounded queue drained by a single
/// task, so the stream has exactly one writer. A session never reconnects:
/// a returning node gets a fresh session.
pub struct NodeSession {
    remote_address: String,
    identity: RwLock<NodeIdentity>,
    queue: mpsc::Sender<ByteMessage>,
    shutdown: CancellationToken,
}

impl NodeSession {
    /// Create a session and spawn its drain loop onto the current runtime.
    pub fn new(
        remote_address: impl Into<String>,
        identity: NodeIdentity,
        sink: StreamSink,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let remote_address = remote_address.into();
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let shutdown = CancellationToken::new();

        spawn_supervised(
            "node-session-drain",
            drain(remote_address.clone(), rx, sink, shutdown.clone()),
        );

        Arc::new(Self {
            remote_address,
            identity: RwLock::new(identity),
            queue,
            shutdown,
        })
    }

    /// Queue a message for the node. Never waits: a full queue is an error.
    pub fn send_response(&self, message: &ByteMessage) -> Result<(), SendError> {
        message::validate(message)?;

        if self.shutdown.is_cancelled() {
            return Err(SendError::Closed);
        }

        self.queue.try_send(message.clone()).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn kind(&self) -> String {
        self.identity().kind
    }

    pub fn tag(&self) -> String {
        self.identity().tag
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_identity(&self, identity: NodeIdentity) {
        *self
            .identity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = identity;
    }

    /// Stop the drain loop. Dropping the sink ends the response stream.
    pub fn quit(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the session has been stopped.
    pub(crate) async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

impl fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSession")
            .field("remote_address", &self.remote_address)
            .field("identity", &self.identity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn drain(
    address: String,
    mut rx: mpsc::Receiver<ByteMessage>,
    sink: StreamSink,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        if sink.send(Ok(message)).await.is_err() {
            warn!(address = %address, "Node stream closed, dropping outbound queue");
            shutdown.cancel();
            break;
        }
    }

    debug!(address = %address, "Node session drain loop stopped");
}

/// Keeps a node registered for as long as its stream is being read. When
/// dropped, the node is removed from the registry unless a newer session
/// has taken its address.
pub(crate) struct NodeGuard {
    session: Arc<NodeSession>,
    registry: Arc<NodeRegistry>,
}

impl NodeGuard {
    pub(crate) fn new(session: Arc<NodeSession>, registry: Arc<NodeRegistry>) -> Self {
        Self { session, registry }
    }

    pub(crate) fn address(&self) -> &str {
        self.session.remote_address()
    }

    pub(crate) fn session(&self) -> &Arc<NodeSession> {
        &self.session
    }
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        self.registry.release(&self.session);
    }
}

impl fmt::Debug for NodeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeGuard")
            .field("address", &self.address())
            .finish()
    }
}
