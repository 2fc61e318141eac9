//! Text hub codec: one JSON object per frame, `0x1e`-terminated.

use bytes::Bytes;
use serde_json::Value;

use super::handshake::RECORD_SEPARATOR;
use super::{
    Binder, HubMessage, HubProtocol, TransferFormat, message_to_value,
    value_to_message,
};
use crate::error::{HubError, HubResult};

/// The JSON hub codec. Stateless; frames are self-delimiting.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    pub const NAME: &'static str = "json";

    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn write_message(&self, message: &HubMessage) -> HubResult<Bytes> {
        let mut frame = serde_json::to_vec(&message_to_value(message))?;
        frame.push(RECORD_SEPARATOR);
        Ok(Bytes::from(frame))
    }

    fn parse_messages(
        &self,
        batch: &[u8],
        binder: &dyn Binder,
    ) -> HubResult<Vec<HubMessage>> {
        let mut messages = Vec::new();
        let mut rest = batch;
        while !rest.is_empty() {
            let Some(end) = rest.iter().position(|&b| b == RECORD_SEPARATOR)
            else {
                // The transport guarantees whole frames per batch.
                return Err(HubError::Codec(
                    "batch ends in an unterminated frame".into(),
                ));
            };
            let value: Value = serde_json::from_slice(&rest[..end])?;
            messages.push(value_to_message(value, binder)?);
            rest = &rest[end + 1..];
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::TypeHint;
    use crate::protocol::test_support::StaticBinder;

    fn parse_one(binder: &StaticBinder, frame: &[u8]) -> HubMessage {
        let protocol = JsonHubProtocol::new();
        let mut messages = protocol.parse_messages(frame, binder).unwrap();
        assert_eq!(messages.len(), 1);
        messages.pop().unwrap()
    }

    #[test]
    fn invocation_round_trips() {
        let protocol = JsonHubProtocol::new();
        let message = HubMessage::Invocation {
            invocation_id: Some("1".into()),
            target: "Add".into(),
            arguments: vec![json!(2), json!(3)],
            binding_error: None,
        };
        let frame = protocol.write_message(&message).unwrap();
        assert_eq!(frame.last(), Some(&RECORD_SEPARATOR));
        let parsed = parse_one(&StaticBinder::default(), &frame);
        assert_eq!(parsed, message);
    }

    #[test]
    fn batch_preserves_frame_order() {
        let protocol = JsonHubProtocol::new();
        let first = protocol
            .write_message(&HubMessage::StreamItem {
                invocation_id: "1".into(),
                item: json!(10),
            })
            .unwrap();
        let second = protocol.write_message(&HubMessage::Ping).unwrap();
        let batch = [first.as_ref(), second.as_ref()].concat();
        let messages = protocol
            .parse_messages(&batch, &StaticBinder::default())
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], HubMessage::StreamItem { .. }));
        assert!(matches!(messages[1], HubMessage::Ping));
    }

    #[test]
    fn unterminated_tail_is_a_codec_error() {
        let protocol = JsonHubProtocol::new();
        let err = protocol
            .parse_messages(b"{\"type\":6}", &StaticBinder::default())
            .unwrap_err();
        assert!(matches!(err, HubError::Codec(_)));
    }

    #[test]
    fn mismatched_arguments_set_a_binding_error() {
        let binder = StaticBinder {
            hints: vec![TypeHint::Text],
            ..Default::default()
        };
        let message = parse_one(
            &binder,
            b"{\"type\":1,\"target\":\"Notify\",\"arguments\":[7]}\x1e",
        );
        let HubMessage::Invocation { binding_error, .. } = message else {
            panic!("expected invocation");
        };
        assert!(binding_error.is_some());
    }

    #[test]
    fn error_completion_round_trips() {
        let protocol = JsonHubProtocol::new();
        let message = HubMessage::Completion {
            invocation_id: "1".into(),
            result: None,
            error: Some("no".into()),
        };
        let frame = protocol.write_message(&message).unwrap();
        assert_eq!(parse_one(&StaticBinder::default(), &frame), message);
    }

    #[test]
    fn cancel_invocation_round_trips() {
        let protocol = JsonHubProtocol::new();
        let message = HubMessage::CancelInvocation {
            invocation_id: "4".into(),
        };
        let frame = protocol.write_message(&message).unwrap();
        assert_eq!(parse_one(&StaticBinder::default(), &frame), message);
    }
}
