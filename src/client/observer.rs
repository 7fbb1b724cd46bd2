use tokio::sync::mpsc;

use crate::control::ControlEvent;
use crate::gate_proto::ByteMessage;

/// Receives traffic and liveness transitions from every endpoint of an
/// [`EndpointRegistry`](crate::EndpointRegistry).
///
/// Called from the endpoints' receive loops; keep implementations quick.
pub trait EndpointObserver: Send + Sync + 'static {
    /// A data message arrived from the gateway at `from`.
    fn on_message(&self, from: &str, message: ByteMessage);

    /// A control message arrived from the gateway at `from`.
    fn on_control(&self, from: &str, event: ControlEvent) {
        let _ = (from, event);
    }

    /// A stream to the `kind` endpoint at `address` was established.
    fn on_peer_up(&self, kind: &str, address: &str) {
        let _ = (kind, address);
    }

    /// The stream to the `kind` endpoint at `address` broke. Fires once per
    /// break.
    fn on_peer_down(&self, kind: &str, address: &str) {
        let _ = (kind, address);
    }
}

/// The observer callbacks as a value, for applications that would rather
/// consume a channel than implement [`EndpointObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    Message { from: String, message: ByteMessage },
    Control { from: String, event: ControlEvent },
    PeerUp { kind: String, address: String },
    PeerDown { kind: String, address: String },
}

impl EndpointObserver for mpsc::UnboundedSender<EndpointEvent> {
    fn on_message(&self, from: &str, message: ByteMessage) {
        let _ = self.send(EndpointEvent::Message {
            from: from.to_owned(),
            message,
        });
    }

    fn on_control(&self, from: &str, event: ControlEvent) {
        let _ = self.send(EndpointEvent::Control {
            from: from.to_owned(),
            event,
        });
    }

    fn on_peer_up(&self, kind: &str, address: &str) {
        let _ = self.send(EndpointEvent::PeerUp {
            kind: kind.to_owned(),
            address: address.to_owned(),
        });
    }

    fn on_peer_down(&self, kind: &str, address: &str) {
        let _ = self.send(EndpointEvent::PeerDown {
            kind: kind.to_owned(),
            address: address.to_owned(),
        });
    }
}
