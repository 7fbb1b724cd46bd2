//! Message id space and helpers on the wire message.

use crate::error::SendError;
use crate::gate_proto::ByteMessage;

/// A node announcing its kind and tag.
pub const MESSAGE_ID_NODE_UP: u32 = 0;
/// An end-user connection bound to, or unbound from, node tags.
pub const MESSAGE_ID_BIND_OR_UNBIND: u32 = 1;
/// An end-user connection was closed.
pub const MESSAGE_ID_CLIENT_CLOSED: u32 = 2;

/// Highest id of the control range. Ids `0..=CONTROL_ID_MAX` never reach a
/// data handler and data messages may never use them.
pub const CONTROL_ID_MAX: u32 = 20;

/// Classification of a message by its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Control,
    Data,
}

impl MessageClass {
    pub fn of(message_id: u32) -> Self {
        if message_id <= CONTROL_ID_MAX {
            MessageClass::Control
        } else {
            MessageClass::Data
        }
    }
}

impl ByteMessage {
    /// Build a data message.
    pub fn data(message_id: u32, conn_id: u32, player_id: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id,
            conn_id,
            player_id,
            data: payload.into(),
            ..Default::default()
        }
    }

    /// Fan the message out to an explicit batch of end-user connections.
    pub fn with_cast_conn_ids(mut self, conn_ids: impl IntoIterator<Item = u32>) -> Self {
        self.cast_conn_ids = conn_ids.into_iter().collect();
        self
    }

    /// Attach an address/kind routing hint.
    pub fn with_route(mut self, address: impl Into<String>, kind: impl Into<String>) -> Self {
        self.address = address.into();
        self.kind = kind.into();
        self
    }

    pub fn class(&self) -> MessageClass {
        MessageClass::of(self.message_id)
    }

    /// The end-user connections this message is meant for: the explicit batch
    /// when present, otherwise the single `conn_id`.
    pub fn target_conn_ids(&self) -> Vec<u32> {
        if self.cast_conn_ids.is_empty() {
            vec![self.conn_id]
        } else {
            self.cast_conn_ids.clone()
        }
    }
}

/// Check a message before it is queued for any peer.
pub(crate) fn validate(message: &ByteMessage) -> Result<(), SendError> {
    if message.data.is_empty() {
        return Err(SendError::EmptyPayload);
    }
    Ok(())
}

/// Check an application data message before it is queued.
pub(crate) fn validate_data(message: &ByteMessage) -> Result<(), SendError> {
    if message.class() == MessageClass::Control {
        return Err(SendError::ReservedMessageId(message.message_id));
    }
    validate(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_range_boundary() {
        assert_eq!(MessageClass::of(0), MessageClass::Control);
        assert_eq!(MessageClass::of(CONTROL_ID_MAX), MessageClass::Control);
        assert_eq!(MessageClass::of(CONTROL_ID_MAX + 1), MessageClass::Data);
        assert_eq!(MessageClass::of(u32::MAX), MessageClass::Data);
    }

    #[test]
    fn test_validate_data_rejects_reserved_id() {
        let msg = ByteMessage::data(MESSAGE_ID_BIND_OR_UNBIND, 1, 1, b"x".to_vec());
        assert!(matches!(
            validate_data(&msg),
            Err(SendError::ReservedMessageId(1))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_payload() {
        let msg = ByteMessage::data(100, 1, 1, Vec::new());
        assert!(matches!(validate_data(&msg), Err(SendError::EmptyPayload)));
        assert!(matches!(validate(&msg), Err(SendError::EmptyPayload)));
    }

    #[test]
    fn test_validate_accepts_data_message() {
        let msg = ByteMessage::data(21, 1, 1, b"hello".to_vec());
        assert!(validate_data(&msg).is_ok());
    }

    #[test]
    fn test_target_conn_ids() {
        let single = ByteMessage::data(30, 7, 0, b"x".to_vec());
        assert_eq!(single.target_conn_ids(), vec![7]);

        let batch = single.with_cast_conn_ids([1, 2, 3]);
        assert_eq!(batch.target_conn_ids(), vec![1, 2, 3]);
    }
}
