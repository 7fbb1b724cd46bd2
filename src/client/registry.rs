use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::endpoint::{Endpoint, ObserverSlot};
use crate::client::observer::EndpointObserver;
use crate::config::RegistryConfig;
use crate::control::{BindOp, BindRequest, ControlEvent, NodeIdentity};
use crate::error::{EndpointError, SendError};
use crate::gate_proto::{ByteMessage, GateReq, GateResp};
use crate::message;
use crate::task::spawn_supervised;

/// Owns every outbound [`Endpoint`], keyed by `host:port`.
///
/// A background sweep forces a reconnect on any endpoint whose connection
/// is missing or failed.
pub struct EndpointRegistry {
    endpoints: DashMap<String, Arc<Endpoint>, ahash::RandomState>,
    identity: NodeIdentity,
    config: RegistryConfig,
    observer: ObserverSlot,
    shutdown: CancellationToken,
}

impl EndpointRegistry {
    /// Create a registry that announces `identity` on every stream it opens,
    /// and start its sweep. Must be called inside a Tokio runtime.
    pub fn new(identity: NodeIdentity, config: RegistryConfig) -> Arc<Self> {
        let registry = Arc::new(Self {
            endpoints: DashMap::with_hasher(ahash::RandomState::new()),
            identity,
            config,
            observer: Arc::new(OnceLock::new()),
            shutdown: CancellationToken::new(),
        });

        spawn_supervised(
            "endpoint-sweep",
            sweep(Arc::downgrade(&registry), registry.shutdown.clone()),
        );
        registry
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Register the observer for every endpoint. Only the first registration
    /// wins.
    pub fn set_observer(&self, observer: Arc<dyn EndpointObserver>) -> bool {
        self.observer.set(observer).is_ok()
    }

    /// Add an endpoint and start connecting in the background. Re-adding an
    /// existing address changes nothing.
    pub fn add_endpoint(
        &self,
        kind: &str,
        host: &str,
        port: u16,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Arc<Endpoint>, EndpointError> {
        if self.shutdown.is_cancelled() {
            return Err(EndpointError::Shutdown);
        }
        if host.is_empty() {
            return Err(EndpointError::InvalidConfig("host must not be empty".into()));
        }
        if port == 0 {
            return Err(EndpointError::InvalidConfig("port must be positive".into()));
        }

        let address = format!("{host}:{port}");
        let endpoint = match self.endpoints.entry(address.clone()) {
            Entry::Occupied(entry) => {
                debug!(address = %address, "Endpoint already registered");
                return Ok(Arc::clone(entry.get()));
            }
            Entry::Vacant(entry) => {
                let endpoint = Endpoint::new(
                    address.clone(),
                    kind.to_owned(),
                    tags.into_iter().map(Into::into).collect(),
                    self.identity.clone(),
                    self.config.endpoint.clone(),
                    Arc::clone(&self.observer),
                );
                entry.insert(Arc::clone(&endpoint));
                endpoint
            }
        };

        info!(address = %address, kind = %kind, "Endpoint added");

        let connecting = Arc::clone(&endpoint);
        spawn_supervised("endpoint-connect", async move {
            if let Err(e) = connecting.connect(false).await {
                debug!(address = %connecting.address(), error = %e, "Initial connect failed");
            }
        });

        Ok(endpoint)
    }

    pub fn get(&self, address: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(address).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every endpoint.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Any endpoint of `kind`, preferring one with a live connection.
    pub fn pick_one_by_kind(&self, kind: &str) -> Option<Arc<Endpoint>> {
        let matching: Vec<_> = self
            .endpoints()
            .into_iter()
            .filter(|endpoint| endpoint.kind() == kind)
            .collect();

        matching
            .iter()
            .find(|endpoint| !endpoint.connection_is_nil())
            .or_else(|| matching.first())
            .cloned()
    }

    /// Cast to the endpoint at `address`.
    pub fn cast_to(&self, address: &str, message: &ByteMessage) -> Result<(), SendError> {
        message::validate_data(message)?;
        self.get(address)
            .ok_or_else(|| SendError::UnknownPeer(address.to_owned()))?
            .cast(message)
    }

    /// Cast to every endpoint of `kind`. Returns how many accepted it.
    pub fn cast_by_kind(&self, kind: &str, message: &ByteMessage) -> Result<usize, SendError> {
        self.cast_where(message, |endpoint| endpoint.kind() == kind)
    }

    /// Cast to every endpoint carrying `tag`. Returns how many accepted it.
    pub fn cast_by_tag(&self, tag: &str, message: &ByteMessage) -> Result<usize, SendError> {
        self.cast_where(message, |endpoint| endpoint.has_tag(tag))
    }

    /// Cast to every endpoint. Returns how many accepted it.
    pub fn cast_to_all(&self, message: &ByteMessage) -> Result<usize, SendError> {
        self.cast_where(message, |_| true)
    }

    /// Ask the gateway at `address` to bind an end-user connection to node
    /// tags.
    pub fn bind_node_tags(&self, address: &str, request: BindRequest) -> Result<(), SendError> {
        let request = BindRequest {
            op: BindOp::Bind,
            ..request
        };
        self.send_control(address, ControlEvent::Bind(request))
    }

    /// Ask the gateway at `address` to unbind an end-user connection.
    pub fn unbind_node_tags(&self, address: &str, request: BindRequest) -> Result<(), SendError> {
        let request = BindRequest {
            op: BindOp::Unbind,
            ..request
        };
        self.send_control(address, ControlEvent::Bind(request))
    }

    /// Issue a unary request, routed by the request's address if set,
    /// otherwise by its kind.
    pub async fn send_unary(&self, request: GateReq) -> Result<GateResp, EndpointError> {
        let endpoint = if !request.address.is_empty() {
            self.get(&request.address)
                .ok_or_else(|| EndpointError::UnknownEndpoint(request.address.clone()))?
        } else if !request.kind.is_empty() {
            self.pick_one_by_kind(&request.kind)
                .ok_or_else(|| EndpointError::NoEndpointForKind(request.kind.clone()))?
        } else {
            return Err(EndpointError::InvalidRequest(
                "request carries neither an address nor a kind".into(),
            ));
        };

        endpoint.send_unary(request).await
    }

    /// Stop the sweep and every endpoint. Safe to call repeatedly.
    pub fn quit(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        for endpoint in self.endpoints() {
            endpoint.quit();
        }
        self.endpoints.clear();
        info!("Endpoint registry shut down");
    }

    fn cast_where(
        &self,
        message: &ByteMessage,
        filter: impl Fn(&Endpoint) -> bool,
    ) -> Result<usize, SendError> {
        message::validate_data(message)?;

        let mut delivered = 0;
        for endpoint in self.endpoints() {
            if !filter(&endpoint) {
                continue;
            }
            match endpoint.cast(message) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(
                    address = %endpoint.address(),
                    error = %e,
                    "Dropping message for endpoint"
                ),
            }
        }
        Ok(delivered)
    }

    fn send_control(&self, address: &str, event: ControlEvent) -> Result<(), SendError> {
        self.get(address)
            .ok_or_else(|| SendError::UnknownPeer(address.to_owned()))?
            .cast_control(&event)
    }
}

impl Drop for EndpointRegistry {
    fn drop(&mut self) {
        self.quit();
    }
}

async fn sweep(registry: Weak<EndpointRegistry>, shutdown: CancellationToken) {
    let Some(period) = registry.upgrade().map(|r| r.config.sweep_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(registry) = registry.upgrade() else {
            break;
        };

        for endpoint in registry.endpoints() {
            if !endpoint.needs_reconnect() {
                continue;
            }
            debug!(
                address = %endpoint.address(),
                state = ?endpoint.connection_state(),
                "Sweep forcing reconnect"
            );
            spawn_supervised("endpoint-reconnect", endpoint.heal());
        }
    }

    debug!("Endpoint sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<EndpointRegistry> {
        EndpointRegistry::new(NodeIdentity::new("front", "f-1"), RegistryConfig::default())
    }

    #[tokio::test]
    async fn test_add_endpoint_is_idempotent() {
        let registry = registry();
        let first = registry.add_endpoint("game", "127.0.0.1", 1, ["g-1"]).unwrap();
        let second = registry.add_endpoint("chat", "127.0.0.1", 1, ["c-1"]).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(second.kind(), "game");
    }

    #[tokio::test]
    async fn test_add_endpoint_rejects_bad_config() {
        let registry = registry();
        assert!(matches!(
            registry.add_endpoint("game", "", 7100, Vec::<String>::new()),
            Err(EndpointError::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.add_endpoint("game", "127.0.0.1", 0, Vec::<String>::new()),
            Err(EndpointError::InvalidConfig(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_pick_and_tag_lookup() {
        let registry = registry();
        registry.add_endpoint("game", "127.0.0.1", 1, ["g-1"]).unwrap();
        registry.add_endpoint("chat", "127.0.0.1", 2, ["c-1"]).unwrap();

        let picked = registry.pick_one_by_kind("chat").unwrap();
        assert_eq!(picked.address(), "127.0.0.1:2");
        assert!(registry.pick_one_by_kind("missing").is_none());
        assert!(registry.get("127.0.0.1:1").unwrap().has_tag("g-1"));
    }

    #[tokio::test]
    async fn test_casts_without_connections() {
        let registry = registry();
        registry.add_endpoint("game", "127.0.0.1", 1, ["g-1"]).unwrap();
        let message = ByteMessage::data(30, 1, 1, b"hi".to_vec());

        assert!(matches!(
            registry.cast_to("127.0.0.1:9", &message),
            Err(SendError::UnknownPeer(_))
        ));
        assert!(matches!(
            registry.cast_to("127.0.0.1:1", &message),
            Err(SendError::Disconnected)
        ));
        assert_eq!(registry.cast_by_kind("game", &message).unwrap(), 0);
        assert_eq!(registry.cast_by_tag("g-1", &message).unwrap(), 0);
        assert!(matches!(
            registry.cast_to_all(&ByteMessage::data(20, 1, 1, b"hi".to_vec())),
            Err(SendError::ReservedMessageId(20))
        ));
    }

    #[tokio::test]
    async fn test_bind_requires_known_address() {
        let registry = registry();
        let request = BindRequest::bind(1, 2).with_node("game", "g-1");
        assert_eq!(request.op, BindOp::Bind);
        assert!(matches!(
            registry.bind_node_tags("127.0.0.1:1", request),
            Err(SendError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_send_unary_routing_errors() {
        let registry = registry();
        let request = GateReq {
            message_id: 30,
            data: b"hi".to_vec(),
            ..Default::default()
        };

        assert!(matches!(
            registry.send_unary(request.clone()).await,
            Err(EndpointError::InvalidRequest(_))
        ));

        let by_kind = GateReq {
            kind: "game".into(),
            ..request.clone()
        };
        assert!(matches!(
            registry.send_unary(by_kind).await,
            Err(EndpointError::NoEndpointForKind(_))
        ));

        let by_address = GateReq {
            address: "127.0.0.1:1".into(),
            ..request
        };
        assert!(matches!(
            registry.send_unary(by_address).await,
            Err(EndpointError::UnknownEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_quit_tears_down_endpoints() {
        let registry = registry();
        let endpoint = registry.add_endpoint("game", "127.0.0.1", 1, ["g-1"]).unwrap();

        registry.quit();
        registry.quit();

        assert!(endpoint.is_closed());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.add_endpoint("game", "127.0.0.1", 1, ["g-1"]),
            Err(EndpointError::Shutdown)
        ));
    }
}
