//! Protocol error types for the control transport.

use std::io;

use procfleet_core::protocol::CodecError;
use thiserror::Error;

/// Maximum frame size after authentication (16 MiB).
///
/// Large enough for any inventory snapshot or forwarded stdin payload;
/// checked against the length prefix BEFORE allocation so an oversized
/// prefix cannot exhaust memory.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum frame size before authentication (4 KiB).
///
/// An unauthenticated peer may only send `AUTH`, which is a handful of
/// bytes. The stricter cap limits what an unauthenticated scanner on the
/// loopback interface can make the daemon buffer.
pub const MAX_AUTH_FRAME_SIZE: usize = 4 * 1024;

/// Errors for control-transport operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame length prefix exceeds the connection's current cap.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Size claimed by the length prefix.
        size: usize,
        /// Cap in force when the frame arrived.
        max: usize,
    },

    /// The frame payload failed to decode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Underlying transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the error is the peer's fault rather than ours.
    ///
    /// Violations terminate the connection; the daemon itself keeps
    /// serving.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. } | Self::Codec(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversize_and_codec_errors_are_violations() {
        assert!(ProtocolError::FrameTooLarge { size: 1, max: 0 }.is_protocol_violation());
        assert!(ProtocolError::Codec(CodecError::EmptyFrame).is_protocol_violation());
        assert!(!ProtocolError::ConnectionClosed.is_protocol_violation());
        assert!(
            !ProtocolError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"))
                .is_protocol_violation()
        );
    }
}
