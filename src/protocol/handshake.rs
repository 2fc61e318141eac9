//! Negotiation frame writer.
//!
//! The first bytes on a fresh connection announce which codec the client
//! speaks. The frame is always a record-separator-terminated JSON object,
//! independent of the negotiated codec, so the server can read it before any
//! codec is selected.

use bytes::Bytes;
use serde::Serialize;

use crate::error::HubResult;

/// Frame terminator shared with the JSON codec.
pub const RECORD_SEPARATOR: u8 = 0x1e;

const HANDSHAKE_VERSION: u32 = 1;

#[derive(Serialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

/// Serializes the one-shot negotiation frame for `protocol_name`.
pub fn handshake_frame(protocol_name: &str) -> HubResult<Bytes> {
    let mut frame = serde_json::to_vec(&HandshakeRequest {
        protocol: protocol_name,
        version: HANDSHAKE_VERSION,
    })?;
    frame.push(RECORD_SEPARATOR);
    Ok(Bytes::from(frame))
}
