//! Registry side: accepts streams from backend nodes, tracks them by
//! address and by (kind, tag), and routes traffic to and from them.
//!
//! ```ignore
//! let gateway = Gateway::new(GatewayConfig::default());
//! gateway.set_handler(Arc::new(MyHandler));
//!
//! let listener = gateway.bind().await?;
//! gateway.serve(listener).await?;
//! ```

mod gateway;
mod handler;
mod observer;
mod registry;
mod service;
mod session;

pub use gateway::{StreamGateway, StreamState};
pub use handler::GatewayHandler;
pub use observer::{ConnectionObserver, ObservedConnection};
pub use registry::{NodeDownObserver, NodeRegistry};
pub use service::Gateway;
pub use session::{NodeSession, StreamSink};
