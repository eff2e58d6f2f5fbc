//! Core types for the procfleet bootstrap supervisor.
//!
//! procfleet is a small privileged daemon that launches, authenticates,
//! monitors, and respawns a fixed set of local child processes. This crate
//! holds everything that is independent of the daemon's runtime: the wire
//! primitive codec, the control-protocol message catalogue, process
//! specifications, auth tokens, the respawn policy, and the base64 stdin
//! framing scheme.
//!
//! # Module Overview
//!
//! - [`wire`]: primitive encoders/decoders (big-endian integers, booleans,
//!   NUL-terminated UTF-8 strings)
//! - [`protocol`]: the opcode catalogue ([`protocol::Request`],
//!   [`protocol::Notification`]) decoded once at the transport boundary
//! - [`token`]: fixed-length random auth tokens with constant-time equality
//! - [`spec`]: process specifications ([`spec::ProcessSpec`] and its builder)
//! - [`respawn`]: respawn policy, backoff, and per-record attempt tracking
//! - [`stdin_frame`]: base64 message framing for child stdin delivery

pub mod protocol;
pub mod respawn;
pub mod spec;
pub mod stdin_frame;
pub mod token;
pub mod wire;

pub use protocol::{Notification, Request, PROTOCOL_VERSION};
pub use respawn::{BackoffConfig, RespawnDirective, RespawnPolicy, RespawnTracker};
pub use spec::{ProcessSpec, CONTROLLER_ABORT_EXIT, RESTART_MARKER, RESTART_REQUESTED_EXIT};
pub use token::{AuthToken, TOKEN_LEN};
