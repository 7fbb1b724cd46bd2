use tracing::debug;

use crate::control::{BindRequest, ClientClosed};
use crate::gate_proto::{ByteMessage, GateReq, GateResp};

/// Application callbacks for traffic arriving from nodes.
///
/// Called from each node's read loop, so implementations should hand work
/// off rather than block.
pub trait GatewayHandler: Send + Sync + 'static {
    /// A data message from the node at `from`.
    fn on_message(&self, from: &str, message: ByteMessage);

    /// A node asked to bind or unbind an end-user connection.
    fn on_bind(&self, from: &str, request: BindRequest) {
        debug!(from = %from, conn_id = request.conn_id, op = ?request.op, "Unhandled bind request");
    }

    /// A node reported that an end-user connection closed.
    fn on_client_closed(&self, from: &str, closed: ClientClosed) {
        debug!(from = %from, conn_id = closed.conn_id, "Unhandled client closed notice");
    }

    /// Answer a unary request. `None` fails the call.
    fn on_request(&self, request: GateReq) -> Option<GateResp> {
        let _ = request;
        None
    }
}
