//! Hub message model and codec seam.
//!
//! A hub protocol turns [`HubMessage`] values into byte frames and parses an
//! inbound byte batch back into messages. Parsing happens against a
//! [`Binder`], the connection's view of what the codec should expect: the
//! declared parameter hints of a registered handler and the declared result
//! hint of a pending invocation.
//!
//! Two codecs ship with the crate:
//!
//! - [`JsonHubProtocol`](json::JsonHubProtocol): text frames, one JSON object
//!   per frame, terminated by the `0x1e` record separator.
//! - [`CborHubProtocol`](cbor::CborHubProtocol): binary frames with a length
//!   prefix and optional zstd compression of the CBOR payload.
//!
//! Both codecs share the same logical wire shape (a `type` discriminant plus
//! per-kind fields), so a message serialized by one and described by the
//! other differs only in framing.

use bytes::Bytes;
use serde_json::Value;
use strum::Display;

use crate::error::{HubError, HubResult};

pub mod cbor;
pub mod handshake;
pub mod json;

/// How the transport should treat the bytes of this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransferFormat {
    Text,
    Binary,
}

/// Declared shape of a handler parameter or invocation result.
///
/// Hints are deliberately coarse. They exist so the codec can reject frames
/// that cannot possibly bind to the declared callback or waiter, not to
/// replace deserialization at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TypeHint {
    /// JSON `null`; the invocation produces no value.
    Unit,
    Bool,
    /// Integral number.
    Int,
    /// Any number.
    Float,
    Text,
    /// Any value; no checking is performed.
    Value,
    /// No expectation is known. The codec discards payloads bound to this.
    Unknown,
}

impl TypeHint {
    /// Whether `value` is acceptable for this hint.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Unit => value.is_null(),
            Self::Bool => value.is_boolean(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Text => value.is_string(),
            Self::Value => true,
            Self::Unknown => false,
        }
    }
}

/// Message kind discriminants as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MessageKind {
    Invocation,
    StreamItem,
    Completion,
    StreamInvocation,
    CancelInvocation,
    Ping,
}

impl MessageKind {
    pub fn wire_type(self) -> u64 {
        match self {
            Self::Invocation => 1,
            Self::StreamItem => 2,
            Self::Completion => 3,
            Self::StreamInvocation => 4,
            Self::CancelInvocation => 5,
            Self::Ping => 6,
        }
    }
}

/// A parsed or to-be-serialized hub frame.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// A call to a named method. Carries an id only when the caller expects
    /// a completion back; fire-and-forget notifications have none.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        /// Set by the codec when the arguments cannot bind to the declared
        /// parameter hints. The frame is dropped at dispatch.
        binding_error: Option<String>,
    },
    /// A call whose response is a sequence of [`HubMessage::StreamItem`]
    /// frames terminated by a [`HubMessage::Completion`].
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        binding_error: Option<String>,
    },
    StreamItem {
        invocation_id: String,
        item: Value,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    CancelInvocation {
        invocation_id: String,
    },
    Ping,
}

impl HubMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Invocation { .. } => MessageKind::Invocation,
            Self::StreamInvocation { .. } => MessageKind::StreamInvocation,
            Self::StreamItem { .. } => MessageKind::StreamItem,
            Self::Completion { .. } => MessageKind::Completion,
            Self::CancelInvocation { .. } => MessageKind::CancelInvocation,
            Self::Ping => MessageKind::Ping,
        }
    }

    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Self::Invocation { invocation_id, .. } => invocation_id.as_deref(),
            Self::StreamInvocation { invocation_id, .. }
            | Self::StreamItem { invocation_id, .. }
            | Self::Completion { invocation_id, .. }
            | Self::CancelInvocation { invocation_id } => {
                Some(invocation_id.as_str())
            }
            Self::Ping => None,
        }
    }
}

/// The connection's answers to the codec's binding questions.
///
/// Implemented by the connection over its handler registry and pending-call
/// table. The codec never sees either directly.
pub trait Binder: Send + Sync {
    /// Declared parameter hints for an inbound invocation of `target`.
    ///
    /// An empty list means "no expectation"; the codec accepts any argument
    /// list in that case.
    fn parameter_hints(&self, target: &str) -> Vec<TypeHint>;

    /// Declared result hint of the pending invocation `invocation_id`, or
    /// [`TypeHint::Unknown`] when no such invocation exists. Unknown tells
    /// the codec to discard the result payload.
    fn result_hint(&self, invocation_id: &str) -> TypeHint;
}

/// A hub wire codec.
///
/// `parse_messages` errors are graded: [`HubError::ProtocolViolation`] is a
/// hard fault that tears the session down, any other error drops only the
/// offending batch.
pub trait HubProtocol: Send + Sync + 'static {
    /// Codec name as announced in the handshake frame.
    fn name(&self) -> &'static str;

    fn transfer_format(&self) -> TransferFormat;

    /// Serializes one message to a self-contained wire frame.
    fn write_message(&self, message: &HubMessage) -> HubResult<Bytes>;

    /// Parses one inbound byte batch into zero or more messages, in order.
    fn parse_messages(
        &self,
        batch: &[u8],
        binder: &dyn Binder,
    ) -> HubResult<Vec<HubMessage>>;
}

// -----------------------------------------------------------------------------
// Logical wire mapping shared by the JSON and CBOR codecs
// -----------------------------------------------------------------------------

pub(crate) fn message_to_value(message: &HubMessage) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("type".into(), message.kind().wire_type().into());
    match message {
        HubMessage::Invocation {
            invocation_id,
            target,
            arguments,
            ..
        } => {
            if let Some(id) = invocation_id {
                map.insert("invocationId".into(), id.as_str().into());
            }
            map.insert("target".into(), target.as_str().into());
            map.insert("arguments".into(), Value::Array(arguments.clone()));
        }
        HubMessage::StreamInvocation {
            invocation_id,
            target,
            arguments,
            ..
        } => {
            map.insert("invocationId".into(), invocation_id.as_str().into());
            map.insert("target".into(), target.as_str().into());
            map.insert("arguments".into(), Value::Array(arguments.clone()));
        }
        HubMessage::StreamItem {
            invocation_id,
            item,
        } => {
            map.insert("invocationId".into(), invocation_id.as_str().into());
            map.insert("item".into(), item.clone());
        }
        HubMessage::Completion {
            invocation_id,
            result,
            error,
        } => {
            map.insert("invocationId".into(), invocation_id.as_str().into());
            if let Some(error) = error {
                map.insert("error".into(), error.as_str().into());
            } else if let Some(result) = result {
                map.insert("result".into(), result.clone());
            }
        }
        HubMessage::CancelInvocation { invocation_id } => {
            map.insert("invocationId".into(), invocation_id.as_str().into());
        }
        HubMessage::Ping => {}
    }
    Value::Object(map)
}

pub(crate) fn value_to_message(
    value: Value,
    binder: &dyn Binder,
) -> HubResult<HubMessage> {
    let Value::Object(mut map) = value else {
        return Err(HubError::Codec("frame is not an object".into()));
    };
    let kind = map
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| HubError::Codec("frame has no numeric type".into()))?;

    match kind {
        1 | 4 => {
            let invocation_id = take_string(&mut map, "invocationId");
            let target = take_string(&mut map, "target")
                .ok_or_else(|| HubError::Codec("invocation has no target".into()))?;
            let arguments = match map.remove("arguments") {
                Some(Value::Array(args)) => args,
                Some(_) => {
                    return Err(HubError::Codec(
                        "invocation arguments are not an array".into(),
                    ));
                }
                None => Vec::new(),
            };
            let binding_error =
                bind_arguments(&binder.parameter_hints(&target), &arguments);
            if kind == 1 {
                Ok(HubMessage::Invocation {
                    invocation_id,
                    target,
                    arguments,
                    binding_error,
                })
            } else {
                let invocation_id = invocation_id.ok_or_else(|| {
                    HubError::Codec("stream invocation has no id".into())
                })?;
                Ok(HubMessage::StreamInvocation {
                    invocation_id,
                    target,
                    arguments,
                    binding_error,
                })
            }
        }
        2 => {
            let invocation_id = require_id(&mut map, "stream item")?;
            let item = map
                .remove("item")
                .ok_or_else(|| HubError::Codec("stream item has no item".into()))?;
            Ok(HubMessage::StreamItem {
                invocation_id,
                item,
            })
        }
        3 => {
            let invocation_id = require_id(&mut map, "completion")?;
            let error = take_string(&mut map, "error");
            let mut result = map.remove("result");
            if error.is_some() && result.is_some() {
                return Err(HubError::Codec(
                    "completion carries both result and error".into(),
                ));
            }
            // Unknown result hint means no waiter can consume the payload.
            if binder.result_hint(&invocation_id) == TypeHint::Unknown {
                result = None;
            }
            Ok(HubMessage::Completion {
                invocation_id,
                result,
                error,
            })
        }
        5 => {
            let invocation_id = require_id(&mut map, "cancel invocation")?;
            Ok(HubMessage::CancelInvocation { invocation_id })
        }
        6 => Ok(HubMessage::Ping),
        other => Err(HubError::ProtocolViolation(format!(
            "unknown message type {other}"
        ))),
    }
}

/// Checks `arguments` against declared `hints`. Returns a description of the
/// first mismatch, or `None` when the frame binds. Empty hints accept any
/// argument list.
pub(crate) fn bind_arguments(
    hints: &[TypeHint],
    arguments: &[Value],
) -> Option<String> {
    if hints.is_empty() {
        return None;
    }
    if hints.len() != arguments.len() {
        return Some(format!(
            "expected {} arguments, got {}",
            hints.len(),
            arguments.len()
        ));
    }
    for (position, (hint, argument)) in
        hints.iter().zip(arguments.iter()).enumerate()
    {
        if !hint.matches(argument) {
            return Some(format!(
                "argument {position} does not match declared {hint} hint"
            ));
        }
    }
    None
}

fn take_string(
    map: &mut serde_json::Map<String, Value>,
    key: &str,
) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

fn require_id(
    map: &mut serde_json::Map<String, Value>,
    what: &str,
) -> HubResult<String> {
    take_string(map, "invocationId")
        .ok_or_else(|| HubError::Codec(format!("{what} has no invocation id")))
}
