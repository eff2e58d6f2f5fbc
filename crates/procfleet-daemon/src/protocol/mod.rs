//! Control-protocol transport for the daemon.
//!
//! Children talk to the supervisor over a loopback TCP socket using
//! length-delimited frames:
//!
//! ```text
//! ┌──────────────┬────────────────────────────┐
//! │ length (u32) │ opcode (u8) + payload ...  │
//! │  big-endian  │   length bytes total       │
//! └──────────────┴────────────────────────────┘
//! ```
//!
//! The submodules split the transport into layers:
//!
//! - [`framing`]: the length-prefix codec with pre-allocation size checks
//! - [`server`]: the accept loop with a connection-concurrency cap
//! - [`session`]: per-connection state (authentication, privilege gate,
//!   request dispatch, notification fan-out)
//!
//! A connection starts with a small frame cap and no privileges; a valid
//! `AUTH` frame identifies which process record the peer is, lifts the cap,
//! and grants control privileges only to the fleet's one privileged record.

pub mod error;
pub mod framing;
pub mod server;
pub mod session;

pub use error::{ProtocolError, MAX_AUTH_FRAME_SIZE, MAX_FRAME_SIZE};
pub use framing::FrameCodec;
pub use server::{ControlServer, ControlServerConfig, IpPreference};
