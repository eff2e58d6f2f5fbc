//! Auth tokens shared between the supervisor and its children.
//!
//! Each process record gets one fixed-length random token at registration.
//! The token is written to the child's stdin as the first message and the
//! child must present it back over the control socket to authenticate.
//! Comparison is constant-time so an attacker probing the control socket
//! learns nothing from response timing.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Token length in bytes. A protocol constant: the `AUTH` payload and the
/// inventory entries carry exactly this many token bytes.
pub const TOKEN_LEN: usize = 16;

/// A fixed-length random authentication token.
///
/// Stable for the lifetime of its process record; never reused by two
/// simultaneously registered records (collision odds at 128 bits are not a
/// practical concern).
#[derive(Clone)]
pub struct AuthToken([u8; TOKEN_LEN]);

impl AuthToken {
    /// Generate a fresh random token from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build a token from raw bytes, or `None` if the length is wrong.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; TOKEN_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Raw token bytes for wire encoding.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Constant-time comparison against candidate bytes.
    ///
    /// A candidate of the wrong length is rejected immediately; the length
    /// is a public protocol constant, so that early exit leaks nothing.
    #[must_use]
    pub fn matches(&self, candidate: &[u8]) -> bool {
        if candidate.len() != TOKEN_LEN {
            return false;
        }
        self.0.ct_eq(candidate).into()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print token material, even at trace level.
        f.write_str("AuthToken(..)")
    }
}
