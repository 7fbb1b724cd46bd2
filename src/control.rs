//! Control payloads carried by reserved message ids.
//!
//! Payloads are JSON with camelCase field names: `{"kind":..,"tag":..}` for
//! an announce and
//! `{"opt":1,"connId":..,"playerId":..,"nodes":{kind: tag}}` for a bind.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::gate_proto::ByteMessage;
use crate::message::{
    MESSAGE_ID_BIND_OR_UNBIND, MESSAGE_ID_CLIENT_CLOSED, MESSAGE_ID_NODE_UP, MessageClass,
};

/// The kind and tag a node announces for itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub tag: String,
}

impl NodeIdentity {
    pub fn new(kind: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            tag: tag.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BindOp {
    Bind,
    Unbind,
}

impl TryFrom<u8> for BindOp {
    type Error = ControlError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BindOp::Bind),
            2 => Ok(BindOp::Unbind),
            other => Err(ControlError::InvalidBindOp(other)),
        }
    }
}

impl From<BindOp> for u8 {
    fn from(op: BindOp) -> Self {
        match op {
            BindOp::Bind => 1,
            BindOp::Unbind => 2,
        }
    }
}

/// Associates an end-user connection with specific node tags, one per kind.
///
/// The gateway never interprets a bind itself; it hands it to the
/// application's handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequest {
    #[serde(rename = "opt")]
    pub op: BindOp,
    pub conn_id: u32,
    #[serde(default)]
    pub player_id: i64,
    #[serde(default)]
    pub nodes: HashMap<String, String>,
}

impl BindRequest {
    pub fn bind(conn_id: u32, player_id: i64) -> Self {
        Self {
            op: BindOp::Bind,
            conn_id,
            player_id,
            nodes: HashMap::new(),
        }
    }

    pub fn unbind(conn_id: u32, player_id: i64) -> Self {
        Self {
            op: BindOp::Unbind,
            ..Self::bind(conn_id, player_id)
        }
    }

    /// Add a kind → tag binding.
    pub fn with_node(mut self, kind: impl Into<String>, tag: impl Into<String>) -> Self {
        self.nodes.insert(kind.into(), tag.into());
        self
    }
}

/// Notice that an end-user connection has gone away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientClosed {
    pub conn_id: u32,
    #[serde(default)]
    pub player_id: i64,
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    NodeUp(NodeIdentity),
    Bind(BindRequest),
    ClientClosed(ClientClosed),
}

impl ControlEvent {
    /// Decode a control message. Fails for data ids, unknown control ids and
    /// malformed payloads.
    pub fn decode(message: &ByteMessage) -> Result<Self, ControlError> {
        let id = message.message_id;
        if MessageClass::of(id) != MessageClass::Control {
            return Err(ControlError::NotControl(id));
        }

        let decode_err = |source| ControlError::Decode {
            message_id: id,
            source,
        };

        match id {
            MESSAGE_ID_NODE_UP => serde_json::from_slice(&message.data)
                .map(ControlEvent::NodeUp)
                .map_err(decode_err),
            MESSAGE_ID_BIND_OR_UNBIND => serde_json::from_slice(&message.data)
                .map(ControlEvent::Bind)
                .map_err(decode_err),
            MESSAGE_ID_CLIENT_CLOSED => serde_json::from_slice(&message.data)
                .map(ControlEvent::ClientClosed)
                .map_err(decode_err),
            other => Err(ControlError::UnknownControl(other)),
        }
    }

    pub fn message_id(&self) -> u32 {
        match self {
            ControlEvent::NodeUp(_) => MESSAGE_ID_NODE_UP,
            ControlEvent::Bind(_) => MESSAGE_ID_BIND_OR_UNBIND,
            ControlEvent::ClientClosed(_) => MESSAGE_ID_CLIENT_CLOSED,
        }
    }

    /// Encode into a wire message.
    pub fn to_message(&self) -> Result<ByteMessage, ControlError> {
        let (conn_id, player_id, data) = match self {
            ControlEvent::NodeUp(identity) => (0, 0, serde_json::to_vec(identity)),
            ControlEvent::Bind(bind) => (bind.conn_id, bind.player_id, serde_json::to_vec(bind)),
            ControlEvent::ClientClosed(closed) => (
                closed.conn_id,
                closed.player_id,
                serde_json::to_vec(closed),
            ),
        };

        Ok(ByteMessage {
            message_id: self.message_id(),
            conn_id,
            player_id,
            data: data.map_err(ControlError::Encode)?,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(message_id: u32, json: &str) -> ByteMessage {
        ByteMessage {
            message_id,
            data: json.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_node_up() {
        let event = ControlEvent::decode(&raw(0, r#"{"kind":"game","tag":"g-1"}"#)).unwrap();
        assert_eq!(event, ControlEvent::NodeUp(NodeIdentity::new("game", "g-1")));
    }

    #[test]
    fn test_decode_node_up_without_tag() {
        let event = ControlEvent::decode(&raw(0, r#"{"kind":"game"}"#)).unwrap();
        assert_eq!(event, ControlEvent::NodeUp(NodeIdentity::new("game", "")));
    }

    #[test]
    fn test_decode_bind_with_wire_field_names() {
        let json = r#"{"opt":2,"connId":7,"playerId":42,"nodes":{"game":"g-1","chat":"c-3"}}"#;
        let ControlEvent::Bind(bind) = ControlEvent::decode(&raw(1, json)).unwrap() else {
            panic!("expected a bind event");
        };
        assert_eq!(bind.op, BindOp::Unbind);
        assert_eq!(bind.conn_id, 7);
        assert_eq!(bind.player_id, 42);
        assert_eq!(bind.nodes.get("chat").map(String::as_str), Some("c-3"));
    }

    #[test]
    fn test_decode_rejects_invalid_bind_op() {
        let result = ControlEvent::decode(&raw(1, r#"{"opt":9,"connId":7}"#));
        assert!(matches!(result, Err(ControlError::Decode { message_id: 1, .. })));
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let result = ControlEvent::decode(&raw(0, "not json"));
        assert!(matches!(result, Err(ControlError::Decode { message_id: 0, .. })));
    }

    #[test]
    fn test_decode_rejects_data_id() {
        let result = ControlEvent::decode(&raw(21, "{}"));
        assert!(matches!(result, Err(ControlError::NotControl(21))));
    }

    #[test]
    fn test_decode_rejects_unassigned_control_id() {
        let result = ControlEvent::decode(&raw(5, "{}"));
        assert!(matches!(result, Err(ControlError::UnknownControl(5))));
    }

    #[test]
    fn test_bind_message_carries_connection() {
        let bind = BindRequest::bind(11, 99).with_node("game", "g-2");
        let msg = ControlEvent::Bind(bind.clone()).to_message().unwrap();
        assert_eq!(msg.message_id, MESSAGE_ID_BIND_OR_UNBIND);
        assert_eq!(msg.conn_id, 11);
        assert_eq!(msg.player_id, 99);
        assert_eq!(ControlEvent::decode(&msg).unwrap(), ControlEvent::Bind(bind));
    }
}
