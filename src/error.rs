use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur when queueing a message for a peer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SendError {
    /// Data messages may not use an id from the control range.
    #[error("message id {0} is reserved for control messages")]
    ReservedMessageId(u32),

    /// The message carries no payload.
    #[error("message payload is empty")]
    EmptyPayload,

    /// The outbound queue is at capacity.
    #[error("outbound queue is full")]
    QueueFull,

    /// The peer has no live stream.
    #[error("peer is not connected")]
    Disconnected,

    /// The peer has been shut down.
    #[error("peer is closed")]
    Closed,

    /// No peer is registered under the given address.
    #[error("no peer registered at '{0}'")]
    UnknownPeer(String),

    /// Failed to build a control message.
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Errors that can occur while encoding or decoding control payloads.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlError {
    /// The message id lies outside the control range.
    #[error("message id {0} is not a control message")]
    NotControl(u32),

    /// The message id lies inside the control range but has no meaning.
    #[error("unknown control message id {0}")]
    UnknownControl(u32),

    /// A bind payload carried an operation other than bind or unbind.
    #[error("invalid bind operation {0}")]
    InvalidBindOp(u8),

    /// The JSON payload could not be decoded.
    #[error("malformed payload for control message {message_id}")]
    Decode {
        message_id: u32,
        #[source]
        source: serde_json::Error,
    },

    /// The JSON payload could not be encoded.
    #[error("failed to encode control payload")]
    Encode(#[source] serde_json::Error),
}

/// Errors that can occur on the endpoint side.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EndpointError {
    /// The endpoint parameters were rejected before any state changed.
    #[error("invalid endpoint configuration: {0}")]
    InvalidConfig(String),

    /// Failed to dial the remote gateway.
    #[error("failed to dial gateway at {address}")]
    Dial {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// The stream could not be opened within the retry bound.
    #[error("failed to open stream to {address}")]
    StreamOpen {
        address: String,
        #[source]
        source: tonic::Status,
    },

    /// Another connect attempt is already running for this endpoint.
    #[error("connect already in progress")]
    ConnectInProgress,

    /// The endpoint has been told to quit.
    #[error("endpoint is shut down")]
    Shutdown,

    /// The endpoint has no live connection.
    #[error("endpoint is not connected")]
    Disconnected,

    /// No endpoint is registered under the given address.
    #[error("no endpoint registered at '{0}'")]
    UnknownEndpoint(String),

    /// No endpoint is registered under the given kind.
    #[error("no endpoint of kind '{0}'")]
    NoEndpointForKind(String),

    /// A unary request carried neither an address nor a kind.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Control(#[from] ControlError),

    /// The unary call failed on the remote side.
    #[error("unary request failed")]
    Unary(#[source] tonic::Status),

    /// The unary call did not complete in time.
    #[error("unary request timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

/// Errors that can occur while mutating the node registry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Nodes must be keyed by a non-empty address.
    #[error("node address must not be empty")]
    EmptyAddress,
}

/// Errors that can occur while hosting the gateway.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// Failed to bind the listening socket.
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The gRPC server failed.
    #[error("gRPC transport error")]
    Transport(#[from] tonic::transport::Error),
}
