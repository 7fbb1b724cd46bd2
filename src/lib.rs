//! A gRPC message gateway between front-line connection processes and a pool
//! of backend nodes.
//!
//! Two halves share one wire protocol (`proto/gate.proto`):
//!
//! - [`client`]: the endpoint side. An [`EndpointRegistry`] dials out to any
//!   number of gateways, keeps every stream alive and routes casts by address,
//!   kind, tag or to everyone.
//! - [`server`]: the registry side. A [`Gateway`] accepts inbound streams,
//!   registers each peer as a node, indexes nodes by kind and tag, and routes
//!   outbound messages to one, many or all of them.

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod message;
pub mod server;

mod task;

pub mod gate_proto {
    include!(concat!(env!("OUT_DIR"), "/gate.rs"));
}

pub use client::{
    ConnectionState, Endpoint, EndpointEvent, EndpointObserver, EndpointRegistry,
};
pub use config::{EndpointConfig, GatewayConfig, RegistryConfig};
pub use control::{BindOp, BindRequest, ClientClosed, ControlEvent, NodeIdentity};
pub use error::{ControlError, EndpointError, GatewayError, RegistryError, SendError};
pub use gate_proto::{ByteMessage, GateReq, GateResp};
pub use message::{CONTROL_ID_MAX, MessageClass};
pub use server::{
    ConnectionObserver, Gateway, GatewayHandler, NodeDownObserver, NodeRegistry, NodeSession,
    StreamGateway, StreamState,
};
