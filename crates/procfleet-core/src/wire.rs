//! Primitive encoders/decoders for the control protocol.
//!
//! The framed transport delivers whole messages; within a message, payload
//! fields use a fixed set of primitive encodings:
//!
//! - integers: 4 bytes, big-endian, signed
//! - longs: 8 bytes, big-endian, signed
//! - booleans: one byte, `0x00` or `0x01`
//! - strings: UTF-8 bytes followed by a NUL terminator
//!
//! Decoders validate before consuming: a truncated buffer or a malformed
//! field yields a [`WireError`] and the message is rejected as a whole.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Errors produced by the primitive field codecs.
#[derive(Debug, Error)]
pub enum WireError {
    /// The buffer ended before the field was complete.
    #[error("payload truncated: needed {needed} more byte(s)")]
    Truncated {
        /// How many more bytes the field required.
        needed: usize,
    },

    /// A string field had no NUL terminator before the buffer ended.
    #[error("string field missing NUL terminator")]
    UnterminatedString,

    /// A string field contained invalid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// A boolean field held a byte other than 0 or 1.
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    /// A count field was negative.
    #[error("negative count field: {0}")]
    NegativeCount(i32),
}

/// Encode a big-endian signed 32-bit integer.
pub fn put_int(buf: &mut impl BufMut, value: i32) {
    buf.put_i32(value);
}

/// Decode a big-endian signed 32-bit integer.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] if fewer than 4 bytes remain.
pub fn get_int(buf: &mut impl Buf) -> Result<i32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated {
            needed: 4 - buf.remaining(),
        });
    }
    Ok(buf.get_i32())
}

/// Encode a big-endian signed 64-bit integer.
pub fn put_long(buf: &mut impl BufMut, value: i64) {
    buf.put_i64(value);
}

/// Decode a big-endian signed 64-bit integer.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] if fewer than 8 bytes remain.
pub fn get_long(buf: &mut impl Buf) -> Result<i64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated {
            needed: 8 - buf.remaining(),
        });
    }
    Ok(buf.get_i64())
}

/// Encode a boolean as a single byte.
pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Decode a single-byte boolean.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] on an empty buffer, or
/// [`WireError::InvalidBool`] for any byte other than 0 or 1.
pub fn get_bool(buf: &mut impl Buf) -> Result<bool, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Truncated { needed: 1 });
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WireError::InvalidBool(other)),
    }
}

/// Encode a NUL-terminated UTF-8 string.
pub fn put_string(buf: &mut impl BufMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Decode a NUL-terminated UTF-8 string.
///
/// # Errors
///
/// Returns [`WireError::UnterminatedString`] if the buffer ends before a
/// NUL byte, or [`WireError::InvalidUtf8`] if the bytes before the
/// terminator are not valid UTF-8.
pub fn get_string(buf: &mut impl Buf) -> Result<String, WireError> {
    let mut raw = Vec::new();
    loop {
        if !buf.has_remaining() {
            return Err(WireError::UnterminatedString);
        }
        let byte = buf.get_u8();
        if byte == 0 {
            break;
        }
        raw.push(byte);
    }
    String::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)
}

/// Validate a decoded count field and convert it to `usize`.
///
/// # Errors
///
/// Returns [`WireError::NegativeCount`] for negative values.
pub fn count_to_usize(count: i32) -> Result<usize, WireError> {
    usize::try_from(count).map_err(|_| WireError::NegativeCount(count))
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn int_round_trip() {
        let mut buf = BytesMut::new();
        put_int(&mut buf, -7);
        put_int(&mut buf, i32::MAX);
        let mut cursor = buf.freeze();
        assert_eq!(get_int(&mut cursor).unwrap(), -7);
        assert_eq!(get_int(&mut cursor).unwrap(), i32::MAX);
    }

    #[test]
    fn int_is_big_endian() {
        let mut buf = BytesMut::new();
        put_int(&mut buf, 0x0102_0304);
        assert_eq!(&buf[..], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn long_round_trip() {
        let mut buf = BytesMut::new();
        put_long(&mut buf, i64::MIN);
        let mut cursor = buf.freeze();
        assert_eq!(get_long(&mut cursor).unwrap(), i64::MIN);
    }

    #[test]
    fn bool_rejects_junk_byte() {
        let mut cursor = bytes::Bytes::from_static(&[0x02]);
        assert!(matches!(
            get_bool(&mut cursor),
            Err(WireError::InvalidBool(0x02))
        ));
    }

    #[test]
    fn string_round_trip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "host-controller");
        put_string(&mut buf, "");
        let mut cursor = buf.freeze();
        assert_eq!(get_string(&mut cursor).unwrap(), "host-controller");
        assert_eq!(get_string(&mut cursor).unwrap(), "");
        assert!(!cursor.has_remaining());
    }

    #[test]
    fn unterminated_string_is_rejected() {
        let mut cursor = bytes::Bytes::from_static(b"no-nul");
        assert!(matches!(
            get_string(&mut cursor),
            Err(WireError::UnterminatedString)
        ));
    }

    #[test]
    fn truncated_int_reports_missing_bytes() {
        let mut cursor = bytes::Bytes::from_static(&[0x00, 0x01]);
        assert!(matches!(
            get_int(&mut cursor),
            Err(WireError::Truncated { needed: 2 })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut cursor = bytes::Bytes::from_static(&[0xff, 0xfe, 0x00]);
        assert!(matches!(
            get_string(&mut cursor),
            Err(WireError::InvalidUtf8)
        ));
    }
}
