use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Streaming;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::client::observer::EndpointObserver;
use crate::config::EndpointConfig;
use crate::control::{ControlEvent, NodeIdentity};
use crate::error::{EndpointError, SendError};
use crate::gate_proto::gate_service_client::GateServiceClient;
use crate::gate_proto::{ByteMessage, GateReq, GateResp};
use crate::message::{self, MessageClass};
use crate::task::spawn_supervised;

pub(crate) type ObserverSlot = Arc<OnceLock<Arc<dyn EndpointObserver>>>;

/// Connection state as seen by the endpoint itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// A connect attempt is running.
    Connecting,
    /// The stream is open.
    Ready,
    /// The last connect, read or write failed.
    TransientFailure,
    /// The endpoint was told to quit.
    Shutdown,
}

struct Connection {
    client: GateServiceClient<Channel>,
    sink: mpsc::Sender<ByteMessage>,
}

struct Link {
    connection: Option<Connection>,
    state: ConnectionState,
    // Bumped whenever the connection is replaced or released, so loops
    // belonging to an older connection can tell they are stale.
    generation: u64,
}

/// One managed outbound connection to a gateway.
///
/// The endpoint object lives as long as its address is registered; only
/// the connection inside it is replaced on reconnect.
pub struct Endpoint {
    address: String,
    kind: String,
    tags: Vec<String>,
    identity: NodeIdentity,
    config: EndpointConfig,
    link: Mutex<Link>,
    queue: mpsc::Sender<ByteMessage>,
    observer: ObserverSlot,
    up: AtomicBool,
    connecting: AtomicBool,
    shutdown: CancellationToken,
}

impl Endpoint {
    pub(crate) fn new(
        address: String,
        kind: String,
        tags: Vec<String>,
        identity: NodeIdentity,
        config: EndpointConfig,
        observer: ObserverSlot,
    ) -> Arc<Self> {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();

        let endpoint = Arc::new(Self {
            address,
            kind,
            tags,
            identity,
            config,
            link: Mutex::new(Link {
                connection: None,
                state: ConnectionState::Idle,
                generation: 0,
            }),
            queue,
            observer,
            up: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            shutdown: shutdown.clone(),
        });

        spawn_supervised("endpoint-drain", drain(Arc::downgrade(&endpoint), rx, shutdown));
        endpoint
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Dial the gateway and open the stream.
    ///
    /// A dial failure is returned without retrying; opening the stream is
    /// retried up to the configured bound. When `is_reconnect` is set the
    /// current connection is released first, otherwise an existing
    /// connection makes this a no-op.
    pub async fn connect(self: &Arc<Self>, is_reconnect: bool) -> Result<(), EndpointError> {
        if self.shutdown.is_cancelled() {
            return Err(EndpointError::Shutdown);
        }
        let _attempt =
            ConnectAttempt::acquire(&self.connecting).ok_or(EndpointError::ConnectInProgress)?;

        if is_reconnect {
            self.release_connection();
        } else if !self.connection_is_nil() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        debug!(address = %self.address, is_reconnect, "Connecting to gateway");

        let opened = match self.dial().await {
            Ok(channel) => self.open_stream(channel).await,
            Err(e) => Err(e),
        };
        let (client, sink, inbound) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.set_state(ConnectionState::TransientFailure);
                return Err(e);
            }
        };

        let generation = self.publish(client, sink)?;
        info!(address = %self.address, kind = %self.kind, "Connected to gateway");
        self.mark_up();

        spawn_supervised(
            "endpoint-receive",
            receive_loop(Arc::clone(self), inbound, generation),
        );
        Ok(())
    }

    /// Queue a data message. Fails fast when the endpoint has no live
    /// connection or the queue is full.
    pub fn cast(&self, message: &ByteMessage) -> Result<(), SendError> {
        message::validate_data(message)?;
        self.enqueue(message.clone())
    }

    pub(crate) fn cast_control(&self, event: &ControlEvent) -> Result<(), SendError> {
        let message = event.to_message()?;
        self.enqueue(message)
    }

    /// Issue a unary request over the current connection.
    pub async fn send_unary(&self, request: GateReq) -> Result<GateResp, EndpointError> {
        if request.data.is_empty() {
            return Err(SendError::EmptyPayload.into());
        }

        let mut client = self
            .lock_link()
            .connection
            .as_ref()
            .map(|connection| connection.client.clone())
            .ok_or(EndpointError::Disconnected)?;

        let response = tokio::time::timeout(self.config.request_timeout, client.gen_req(request))
            .await?
            .map_err(EndpointError::Unary)?;
        Ok(response.into_inner())
    }

    pub fn connection_is_nil(&self) -> bool {
        self.lock_link().connection.is_none()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock_link().state
    }

    /// Whether the liveness sweep should force a reconnect.
    pub fn needs_reconnect(&self) -> bool {
        if self.shutdown.is_cancelled() || self.connecting.load(Ordering::Acquire) {
            return false;
        }
        let link = self.lock_link();
        link.connection.is_none()
            || matches!(
                link.state,
                ConnectionState::TransientFailure | ConnectionState::Shutdown
            )
    }

    /// Stop every loop and release the connection. Safe to call repeatedly.
    pub fn quit(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let mut link = self.lock_link();
        link.generation += 1;
        link.connection = None;
        link.state = ConnectionState::Shutdown;
        info!(address = %self.address, "Endpoint shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn enqueue(&self, message: ByteMessage) -> Result<(), SendError> {
        if self.shutdown.is_cancelled() {
            return Err(SendError::Closed);
        }
        if self.connection_is_nil() {
            return Err(SendError::Disconnected);
        }

        self.queue.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    async fn dial(&self) -> Result<Channel, EndpointError> {
        let endpoint = Channel::from_shared(format!("http://{}", self.address))
            .map_err(|e| EndpointError::InvalidConfig(e.to_string()))?
            .connect_timeout(self.config.dial_timeout)
            .tcp_nodelay(true);

        endpoint.connect().await.map_err(|source| {
            warn!(address = %self.address, error = %source, "Failed to dial gateway");
            EndpointError::Dial {
                address: self.address.clone(),
                source,
            }
        })
    }

    async fn open_stream(
        &self,
        channel: Channel,
    ) -> Result<
        (
            GateServiceClient<Channel>,
            mpsc::Sender<ByteMessage>,
            Streaming<ByteMessage>,
        ),
        EndpointError,
    > {
        let announce = ControlEvent::NodeUp(self.identity.clone()).to_message()?;
        let mut attempt = 0;

        loop {
            let (sink, rx) = mpsc::channel(self.config.stream_buffer.max(1));
            // The announce goes out first on every new stream. The channel is
            // fresh, so there is room for it.
            let _ = sink.try_send(announce.clone());

            let mut client = GateServiceClient::new(channel.clone());
            match client.bind_stream(ReceiverStream::new(rx)).await {
                Ok(response) => return Ok((client, sink, response.into_inner())),
                Err(status) if attempt < self.config.stream_open_retries => {
                    attempt += 1;
                    warn!(
                        address = %self.address,
                        attempt,
                        error = %status,
                        "Failed to open stream, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(EndpointError::Shutdown),
                        _ = tokio::time::sleep(self.config.stream_retry_delay) => {}
                    }
                }
                Err(source) => {
                    warn!(address = %self.address, error = %source, "Failed to open stream");
                    return Err(EndpointError::StreamOpen {
                        address: self.address.clone(),
                        source,
                    });
                }
            }
        }
    }

    fn publish(
        &self,
        client: GateServiceClient<Channel>,
        sink: mpsc::Sender<ByteMessage>,
    ) -> Result<u64, EndpointError> {
        let mut link = self.lock_link();
        if self.shutdown.is_cancelled() {
            return Err(EndpointError::Shutdown);
        }
        link.generation += 1;
        link.connection = Some(Connection { client, sink });
        link.state = ConnectionState::Ready;
        Ok(link.generation)
    }

    fn release_connection(&self) {
        {
            let mut link = self.lock_link();
            link.generation += 1;
            link.connection = None;
        }
        self.mark_down();
    }

    /// Clear the connection if it still belongs to `generation`. Returns
    /// false when a newer connection already replaced it.
    fn connection_lost(&self, generation: u64) -> bool {
        let mut link = self.lock_link();
        if link.generation != generation {
            return false;
        }
        link.connection = None;
        if link.state != ConnectionState::Shutdown {
            link.state = ConnectionState::TransientFailure;
        }
        true
    }

    fn current_sink(&self) -> Option<(mpsc::Sender<ByteMessage>, u64)> {
        let link = self.lock_link();
        link.connection
            .as_ref()
            .map(|connection| (connection.sink.clone(), link.generation))
    }

    fn write_failed(&self, generation: u64) {
        let mut link = self.lock_link();
        if link.generation == generation && link.state == ConnectionState::Ready {
            link.state = ConnectionState::TransientFailure;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut link = self.lock_link();
        if link.state != ConnectionState::Shutdown {
            link.state = state;
        }
    }

    fn mark_up(&self) {
        if !self.up.swap(true, Ordering::AcqRel) {
            if let Some(observer) = self.observer.get() {
                observer.on_peer_up(&self.kind, &self.address);
            }
        }
    }

    fn mark_down(&self) {
        if self.up.swap(false, Ordering::AcqRel) {
            info!(address = %self.address, kind = %self.kind, "Gateway down");
            if let Some(observer) = self.observer.get() {
                observer.on_peer_down(&self.kind, &self.address);
            }
        }
    }

    fn dispatch(&self, message: ByteMessage) {
        let Some(observer) = self.observer.get() else {
            debug!(
                address = %self.address,
                message_id = message.message_id,
                "No observer registered, dropping message"
            );
            return;
        };

        match message.class() {
            MessageClass::Data => observer.on_message(&self.address, message),
            MessageClass::Control => match ControlEvent::decode(&message) {
                Ok(event) => observer.on_control(&self.address, event),
                Err(e) => warn!(address = %self.address, error = %e, "Dropping control message"),
            },
        }
    }

    /// Reconnect unless the connection is healthy or another attempt is
    /// already running. Shared by the read loop and the registry sweep.
    pub(crate) async fn heal(self: Arc<Self>) {
        if !self.needs_reconnect() {
            return;
        }
        match self.connect(true).await {
            Ok(()) => {}
            Err(EndpointError::ConnectInProgress | EndpointError::Shutdown) => {}
            Err(e) => debug!(address = %self.address, error = %e, "Reconnect failed"),
        }
    }

    fn schedule_reconnect(self: Arc<Self>) {
        let delay = self.config.reconnect_delay;
        spawn_supervised("endpoint-reconnect", async move {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            self.heal().await;
        });
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("tags", &self.tags)
            .field("state", &self.connection_state())
            .finish()
    }
}

/// Marks a connect attempt as running until dropped.
struct ConnectAttempt<'a>(&'a AtomicBool);

impl<'a> ConnectAttempt<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn receive_loop(
    endpoint: Arc<Endpoint>,
    mut inbound: Streaming<ByteMessage>,
    generation: u64,
) {
    loop {
        let next = tokio::select! {
            _ = endpoint.shutdown.cancelled() => return,
            next = inbound.message() => next,
        };

        match next {
            Ok(Some(message)) => endpoint.dispatch(message),
            Ok(None) => {
                debug!(address = %endpoint.address, "Gateway closed the stream");
                break;
            }
            Err(status) => {
                warn!(address = %endpoint.address, error = %status, "Gateway stream failed");
                break;
            }
        }
    }

    if !endpoint.connection_lost(generation) {
        return;
    }
    endpoint.mark_down();

    if !endpoint.shutdown.is_cancelled() {
        endpoint.schedule_reconnect();
    }
}

async fn drain(
    endpoint: Weak<Endpoint>,
    mut rx: mpsc::Receiver<ByteMessage>,
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

        let Some(endpoint) = endpoint.upgrade() else {
            break;
        };
        let Some((sink, generation)) = endpoint.current_sink() else {
            debug!(
                address = %endpoint.address,
                message_id = message.message_id,
                "No connection, dropping queued message"
            );
            continue;
        };

        if sink.send(message).await.is_err() {
            warn!(address = %endpoint.address, "Write to gateway stream failed");
            endpoint.write_failed(generation);
        }
    }
}
