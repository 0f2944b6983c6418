//! Kafka frame codec.
//!
//! Every Kafka message, request or response, travels as a 4-byte
//! big-endian size followed by that many bytes. [`FrameCodec`] only deals
//! with that envelope: it yields the payload (header and body) and
//! prepends the size on the way out. Both the client connection and the
//! mock broker frame their traffic with it.
//!
//! The size comes from the peer, so it is checked against
//! [`MAX_FRAME_SIZE`] before any buffer is reserved. Talking plaintext to
//! a TLS listener makes the first record header (`15 03 03 ..`) read as a
//! ~350 MB frame; that is reported as a decode error instead.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ClientError;

/// Largest frame accepted in either direction (the broker's default
/// `socket.request.max.bytes`).
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

const SIZE_PREFIX: usize = 4;

/// Length-prefixed framing for Kafka connections.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// A codec with a smaller frame limit.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, ClientError> {
        let Some(prefix) = src.get(..SIZE_PREFIX) else {
            return Ok(None);
        };
        let size = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

        if size > self.max_frame_size {
            return Err(ClientError::ProtocolDecode {
                message: format!(
                    "frame size {size} exceeds maximum {} (leading bytes {:02x?})",
                    self.max_frame_size, prefix
                ),
            });
        }

        let needed = SIZE_PREFIX + size;
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        src.advance(SIZE_PREFIX);
        Ok(Some(src.split_to(size)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ClientError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), ClientError> {
        let size = u32::try_from(payload.len())
            .ok()
            .filter(|size| *size as usize <= self.max_frame_size)
            .ok_or_else(|| ClientError::ProtocolEncode {
                message: format!(
                    "frame size {} exceeds maximum {}",
                    payload.len(),
                    self.max_frame_size
                ),
            })?;

        dst.reserve(SIZE_PREFIX + payload.len());
        dst.put_u32(size);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
