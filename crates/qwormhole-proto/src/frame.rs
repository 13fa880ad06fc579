//! Length-prefixed wire framing.
//!
//! On the wire a frame is a 4-byte big-endian unsigned length followed by an
//! opaque payload. No other framing metadata exists at this layer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default `max_frame_length`: 4 MiB.
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = 4 * 1024 * 1024;

/// Write `payload` as a length-prefixed frame into `dst`.
///
/// # Panics
///
/// Panics if `payload.len()` does not fit in a `u32`; in practice payloads
/// are bounded well below that by `max_frame_length` before this is called.
pub fn encode_frame(payload: &[u8], dst: &mut impl BufMut) {
    // INVARIANT: callers validate payload.len() <= max_frame_length (<= 4 GiB
    // by construction) before encoding, so this always fits in u32.
    #[allow(clippy::expect_used)]
    let len = u32::try_from(payload.len())
        .expect("invariant: framed payload length fits in u32 (bounded by max_frame_length)");
    dst.put_u32(len);
    dst.put_slice(payload);
}

/// Streaming length-prefixed frame decoder (component A).
///
/// Accumulates arbitrary byte chunks and yields complete payloads once enough
/// bytes have arrived. An oversized frame poisons the decoder: every
/// subsequent call returns the same error until [`FrameDecoder::reset`].
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_length: u32,
    accumulator: BytesMut,
    poisoned: bool,
}

impl FrameDecoder {
    /// Construct a decoder that rejects frames longer than `max_frame_length`.
    #[must_use]
    pub fn new(max_frame_length: u32) -> Self {
        Self { max_frame_length, accumulator: BytesMut::new(), poisoned: false }
    }

    /// Construct a decoder using [`DEFAULT_MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn with_default_max_frame_length() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Append raw bytes read from the socket to the internal accumulator.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] if the decoder is already
    /// poisoned from a prior oversized frame.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.poison_check()?;
        self.accumulator.extend_from_slice(chunk);
        Ok(())
    }

    /// Pull the next complete frame out of the accumulator, if any.
    ///
    /// Call repeatedly after each `push` until it returns `Ok(None)`; a
    /// single chunk may contain zero, one, or many frames.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] the first time the length
    /// prefix exceeds `max_frame_length`, and on every call thereafter.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        self.poison_check()?;

        if self.accumulator.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
        len_bytes.copy_from_slice(&self.accumulator[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_be_bytes(len_bytes);

        if len > self.max_frame_length {
            self.accumulator.clear();
            self.poisoned = true;
            return Err(ProtocolError::FrameTooLarge { size: len, max: self.max_frame_length });
        }

        let total = LENGTH_PREFIX_SIZE + len as usize;
        if self.accumulator.len() < total {
            return Ok(None);
        }

        self.accumulator.advance(LENGTH_PREFIX_SIZE);
        let payload = self.accumulator.split_to(len as usize).freeze();
        Ok(Some(payload))
    }

    /// Clear accumulated bytes and un-poison the decoder.
    pub fn reset(&mut self) {
        self.accumulator.clear();
        self.poisoned = false;
    }

    /// Whether an oversized frame has poisoned this decoder.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Bytes currently buffered but not yet forming a complete frame.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.accumulator.len()
    }

    fn poison_check(&self) -> Result<()> {
        if self.poisoned {
            return Err(ProtocolError::FrameTooLarge { size: 0, max: self.max_frame_length });
        }
        Ok(())
    }
}
