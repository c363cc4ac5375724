//! Length-prefixed frame codec.
//!
//! Wire layout per frame:
//!
//! ```text
//! [length (N bytes, big-endian)] [ciphertext (length bytes)]
//! ```
//!
//! `N` is the length-header width (`max_bytes`), 4 by default and
//! renegotiable at runtime via the communication sub-protocol. The two
//! directions of a connection renegotiate independently, so the codec keeps
//! separate send and receive widths: the sender switches its encode width
//! immediately after the negotiation request frame is written, the receiver
//! switches its decode width when it processes that request. In-flight
//! frames framed with the old width therefore always parse.
//!
//! A frame whose declared length exceeds the hard frame cap is a
//! desynchronized stream and fails the connection; a partially received
//! frame simply waits for more bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{constants, ProtocolError, Result};

/// Hard cap on a single frame's payload, regardless of header width.
/// Length validation happens before allocation, so a corrupt or hostile
/// length header cannot exhaust memory.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frame codec with independently renegotiable send/receive header widths
#[derive(Debug, Clone)]
pub struct FrameCodec {
    send_width: usize,
    recv_width: usize,
}

impl FrameCodec {
    /// Codec with the same initial width in both directions
    ///
    /// # Errors
    /// `ConfigError` if `width` is outside `1..=8`.
    pub fn new(width: usize) -> Result<Self> {
        check_width(width)?;
        Ok(Self {
            send_width: width,
            recv_width: width,
        })
    }

    /// Largest payload a `width`-byte length header admits, capped by
    /// [`MAX_FRAME_BYTES`]
    pub fn max_payload(width: usize) -> u128 {
        (1u128 << (8 * width as u32)).min(MAX_FRAME_BYTES as u128 + 1)
    }

    /// Current encode-side header width
    pub fn send_width(&self) -> usize {
        self.send_width
    }

    /// Current decode-side header width
    pub fn recv_width(&self) -> usize {
        self.recv_width
    }

    /// Change the encode-side header width
    pub fn set_send_width(&mut self, width: usize) -> Result<()> {
        check_width(width)?;
        self.send_width = width;
        Ok(())
    }

    /// Change the decode-side header width
    pub fn set_recv_width(&mut self, width: usize) -> Result<()> {
        check_width(width)?;
        self.recv_width = width;
        Ok(())
    }

    /// Frame one payload into `dst`.
    ///
    /// # Errors
    /// `Oversize` if the payload does not fit the current send width.
    pub fn encode_frame(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        let limit = Self::max_payload(self.send_width);
        if payload.len() as u128 >= limit {
            return Err(ProtocolError::Oversize {
                size: payload.len(),
                limit,
            });
        }

        dst.reserve(self.send_width + payload.len());
        let len_bytes = (payload.len() as u64).to_be_bytes();
        dst.put_slice(&len_bytes[8 - self.send_width..]);
        dst.put_slice(payload);
        Ok(())
    }

    /// Slice the next complete frame's payload out of `src`, if one is
    /// fully buffered.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a frame (or
    /// nothing); the remainder stays in `src` for the next read. Callers
    /// must re-invoke after every decode because a processed frame may have
    /// changed the receive width.
    pub fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < self.recv_width {
            // Partial length header; wait for the rest.
            return Ok(None);
        }

        let mut len_bytes = [0u8; 8];
        len_bytes[8 - self.recv_width..].copy_from_slice(&src[..self.recv_width]);
        let length = u64::from_be_bytes(len_bytes) as usize;

        if (length as u128) >= Self::max_payload(self.recv_width) {
            return Err(ProtocolError::Framing(constants::ERR_FRAME_DESYNC.into()));
        }
        if src.len() < self.recv_width + length {
            return Ok(None);
        }

        src.advance(self.recv_width);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            send_width: crate::config::DEFAULT_MAX_BYTES,
            recv_width: crate::config::DEFAULT_MAX_BYTES,
        }
    }
}

fn check_width(width: usize) -> Result<()> {
    if (1..=8).contains(&width) {
        Ok(())
    } else {
        Err(ProtocolError::ConfigError(
            constants::ERR_INVALID_WIDTH.into(),
        ))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        self.encode_frame(&item, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        self.decode_frame(src)
    }
}
