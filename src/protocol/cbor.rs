//! Binary hub codec: length-prefixed CBOR with optional zstd compression.
//!
//! Wire format of each frame:
//!
//! ```text
//! [total_len: u32 BE][flags: u8][payload: bytes]
//! ```
//!
//! `total_len` covers the flags byte plus the payload. `flags` is `0x00` for
//! raw CBOR and `0x01` for zstd-compressed CBOR. Payloads are compressed only
//! past [`COMPRESS_THRESHOLD`], where the savings outweigh the CPU cost.
//!
//! The decoder refuses frames larger than a configurable cap so a bad peer
//! cannot make the client buffer unbounded memory.

use std::io::Write;
use std::sync::Mutex;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use super::{
    Binder, HubMessage, HubProtocol, TransferFormat, message_to_value,
    value_to_message,
};
use crate::error::{HubError, HubResult};

/// Minimum CBOR payload size before zstd is applied.
const COMPRESS_THRESHOLD: usize = 1024;

/// zstd level; low latency matters more than ratio on an RPC link.
const COMPRESS_LEVEL: i32 = 3;

/// Default cap on a single inbound frame.
pub const DEFAULT_MAX_FRAME: usize = 8 * 1024 * 1024;

const LEN_PREFIX_SIZE: usize = 4;

const FLAG_RAW: u8 = 0x00;
const FLAG_COMPRESSED: u8 = 0x01;

/// Reusable serialization buffer that sheds capacity after bursts of large
/// frames. Tracks the high-water mark over a window of uses and shrinks when
/// capacity has grown well past it.
struct Scratch {
    buf: Vec<u8>,
    high_water: usize,
    uses: usize,
}

impl Scratch {
    const MIN_CAPACITY: usize = 2048;
    const SHRINK_FACTOR: usize = 3;
    const CHECK_INTERVAL: usize = 64;

    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(Self::MIN_CAPACITY),
            high_water: Self::MIN_CAPACITY,
            uses: 0,
        }
    }

    fn vec(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    fn finish(&mut self) {
        self.high_water = self.high_water.max(self.buf.len());
        self.uses += 1;
        self.buf.clear();
        if self.uses >= Self::CHECK_INTERVAL {
            if self.buf.capacity()
                > self.high_water.saturating_mul(Self::SHRINK_FACTOR)
            {
                self.buf
                    .shrink_to((self.high_water * 3 / 2).max(Self::MIN_CAPACITY));
            }
            self.high_water = Self::MIN_CAPACITY;
            self.uses = 0;
        }
    }
}

/// Framing layer: CBOR value in, length-prefixed frame out, and back.
///
/// The decoder item is the raw wire [`Value`]; mapping to [`HubMessage`]
/// happens in [`CborHubProtocol`] where the binder is available.
struct FrameCodec {
    max_frame: usize,
    cbor: Scratch,
    compress: Scratch,
}

impl FrameCodec {
    fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            cbor: Scratch::new(),
            compress: Scratch::new(),
        }
    }
}

impl Encoder<&Value> for FrameCodec {
    type Error = HubError;

    fn encode(
        &mut self,
        item: &Value,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        ciborium::into_writer(item, self.cbor.vec())
            .map_err(|e| HubError::Codec(e.to_string()))?;

        let (payload, flags) = if self.cbor.vec().len() > COMPRESS_THRESHOLD {
            let mut encoder =
                zstd::Encoder::new(self.compress.vec(), COMPRESS_LEVEL)?;
            encoder.write_all(&self.cbor.buf)?;
            encoder.finish()?;
            (self.compress.buf.as_slice(), FLAG_COMPRESSED)
        } else {
            (self.cbor.buf.as_slice(), FLAG_RAW)
        };

        let total_len = 1 + payload.len();
        dst.reserve(LEN_PREFIX_SIZE + total_len);
        dst.put_u32(total_len as u32);
        dst.put_u8(flags);
        dst.extend_from_slice(payload);

        self.cbor.finish();
        if flags == FLAG_COMPRESSED {
            self.compress.finish();
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Value;
    type Error = HubError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek the length without consuming it.
        let total_len =
            u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if total_len > self.max_frame {
            return Err(HubError::Codec(format!(
                "frame of {total_len} bytes exceeds the {} byte cap",
                self.max_frame
            )));
        }
        if total_len < 1 {
            return Err(HubError::Codec(
                "frame is too short for a flags byte".into(),
            ));
        }
        if src.len() < LEN_PREFIX_SIZE + total_len {
            return Ok(None);
        }

        src.advance(LEN_PREFIX_SIZE);
        let flags = src.get_u8();
        let payload = src.split_to(total_len - 1);

        let value = match flags {
            FLAG_COMPRESSED => {
                let decoder = zstd::Decoder::new(payload.reader())?;
                ciborium::from_reader(decoder)
                    .map_err(|e| HubError::Codec(e.to_string()))?
            }
            FLAG_RAW => ciborium::from_reader(payload.reader())
                .map_err(|e| HubError::Codec(e.to_string()))?,
            unknown => {
                return Err(HubError::Codec(format!(
                    "unknown frame flags {unknown:#04x}"
                )));
            }
        };
        Ok(Some(value))
    }
}

/// The binary hub codec.
///
/// Wraps a [`FrameCodec`] behind a mutex: writes come from the send path
/// while parses come from the receive task, and both reuse the scratch
/// buffers.
pub struct CborHubProtocol {
    codec: Mutex<FrameCodec>,
}

impl CborHubProtocol {
    pub const NAME: &'static str = "cbor";

    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    /// Codec with a custom inbound frame cap.
    #[must_use]
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            codec: Mutex::new(FrameCodec::new(max_frame)),
        }
    }
}

impl Default for CborHubProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl HubProtocol for CborHubProtocol {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Binary
    }

    fn write_message(&self, message: &HubMessage) -> HubResult<Bytes> {
        let mut dst = BytesMut::new();
        let mut codec = self.codec.lock().expect("codec lock poisoned");
        codec.encode(&message_to_value(message), &mut dst)?;
        Ok(dst.freeze())
    }

    fn parse_messages(
        &self,
        batch: &[u8],
        binder: &dyn Binder,
    ) -> HubResult<Vec<HubMessage>> {
        let mut src = BytesMut::from(batch);
        let mut messages = Vec::new();
        let mut codec = self.codec.lock().expect("codec lock poisoned");
        while let Some(value) = codec.decode(&mut src)? {
            messages.push(value_to_message(value, binder)?);
        }
        if !src.is_empty() {
            // The transport guarantees whole frames per batch.
            return Err(HubError::Codec(
                "batch ends in an unterminated frame".into(),
            ));
        }
        Ok(messages)
    }
}
