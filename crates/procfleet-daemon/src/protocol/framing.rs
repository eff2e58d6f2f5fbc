//! Length-prefix frame codec.
//!
//! Frames are a 4-byte big-endian length followed by that many payload
//! bytes. The decoder validates the length prefix against the connection's
//! current cap before reserving any buffer space.
//!
//! A fresh codec enforces the small pre-authentication cap; once the peer
//! authenticates, [`FrameCodec::upgrade_to_full_frame_size`] lifts it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, MAX_AUTH_FRAME_SIZE, MAX_FRAME_SIZE};

const LENGTH_PREFIX_LEN: usize = 4;

/// Codec for length-delimited control frames.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// A codec with the pre-authentication frame cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_AUTH_FRAME_SIZE,
        }
    }

    /// A codec with the full post-authentication cap, for clients that
    /// connect to an already-trusted endpoint.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Lift the cap to the full frame size after authentication.
    pub fn upgrade_to_full_frame_size(&mut self) {
        self.max_frame_size = MAX_FRAME_SIZE;
    }

    /// The cap currently in force.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let frame_len = u32::from_be_bytes(prefix) as usize;

        // Validate before reserving so a hostile prefix cannot force a
        // multi-megabyte allocation.
        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if src.len() < LENGTH_PREFIX_LEN + frame_len {
            src.reserve(LENGTH_PREFIX_LEN + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(frame_len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(LENGTH_PREFIX_LEN + frame.len());
        dst.put_u32(u32::try_from(frame.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: frame.len(),
            max: self.max_frame_size,
        })?);
        dst.put_slice(&frame);
        Ok(())
    }
}
