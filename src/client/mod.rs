//! Endpoint side: dials out to gateways, announces the local node on every
//! stream, and keeps the streams alive.
//!
//! ```ignore
//! let registry = EndpointRegistry::new(NodeIdentity::new("game", "g-1"), RegistryConfig::default());
//! registry.set_observer(Arc::new(tx));
//! registry.add_endpoint("gate", "10.0.0.5", 7100, ["gate-1"])?;
//!
//! registry.cast_by_kind("gate", &ByteMessage::data(100, conn_id, player_id, payload))?;
//! ```

mod endpoint;
mod observer;
mod registry;

pub use endpoint::{ConnectionState, Endpoint};
pub use observer::{EndpointEvent, EndpointObserver};
pub use registry::EndpointRegistry;
