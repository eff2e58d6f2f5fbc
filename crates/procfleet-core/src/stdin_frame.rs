//! Line-oriented base64 framing for child stdin delivery.
//!
//! The supervisor writes control messages (the auth token at launch,
//! forwarded reconnect messages) to a child's stdin. Children may also read
//! application input from the same pipe, so control messages are framed as
//! single base64 lines: standard alphabet, padded, terminated by `\n`. A
//! reader that is not expecting control traffic sees one printable line it
//! can discard; a reader that is gets unambiguous binary payloads of any
//! size.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Errors produced while decoding framed stdin lines.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A line was not valid base64.
    #[error("invalid base64 in framed line: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// Encode one payload as a framed line, newline included.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut line = STANDARD.encode(payload).into_bytes();
    line.push(b'\n');
    line
}

/// Incremental decoder for framed stdin bytes.
///
/// Feed it raw chunks as they arrive; it buffers partial lines across calls
/// and yields one decoded payload per completed line. Carriage returns
/// before the newline are tolerated.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every payload completed by it.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidBase64`] if a completed line fails to
    /// decode; the decoder stays usable for subsequent lines.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut payloads = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.pending);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                payloads.push(STANDARD.decode(&line)?);
            } else {
                self.pending.push(byte);
            }
        }
        Ok(payloads)
    }

    /// Bytes buffered while waiting for a line terminator.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
