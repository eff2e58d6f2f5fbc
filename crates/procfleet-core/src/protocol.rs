//! Control-protocol message catalogue.
//!
//! Messages travel over a length-delimited framed transport; within a
//! frame, the first byte is the opcode and the rest is the opcode-specific
//! payload built from the [`crate::wire`] primitives. Frames are decoded
//! once at the transport boundary into the tagged enums here; everything
//! downstream dispatches with an exhaustive `match`.
//!
//! The inbound ([`Request`]) and outbound ([`Notification`]) opcode spaces
//! are independent; several values are reused across directions.
//!
//! # Privilege
//!
//! Only [`Request::Auth`] is honored on an unauthenticated or unprivileged
//! connection. Every other request is fleet control and requires the one
//! privileged session. That gate lives in the session router, not here; the
//! codec decodes everything it can.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::token::TOKEN_LEN;
use crate::wire::{
    count_to_usize, get_bool, get_int, get_long, get_string, put_bool, put_int, put_long,
    put_string, WireError,
};

/// Protocol version carried in the `AUTH` handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Inbound opcodes (child → supervisor).
pub mod op {
    /// Authentication handshake; the only unprivileged opcode.
    pub const AUTH: u8 = 0xEE;
    pub const ADD_PROCESS: u8 = 0x10;
    pub const START_PROCESS: u8 = 0x11;
    pub const STOP_PROCESS: u8 = 0x12;
    pub const REMOVE_PROCESS: u8 = 0x13;
    pub const SEND_STDIN: u8 = 0x14;
    pub const REQUEST_PROCESS_INVENTORY: u8 = 0x15;
    pub const RECONNECT_PROCESS: u8 = 0x16;
    pub const SHUTDOWN: u8 = 0x17;
    pub const DESTROY_PROCESS: u8 = 0x18;
    pub const KILL_PROCESS: u8 = 0x19;
}

/// Outbound opcodes (supervisor → child).
pub mod notify_op {
    pub const PROCESS_ADDED: u8 = 0x10;
    pub const PROCESS_STARTED: u8 = 0x11;
    pub const PROCESS_STOPPED: u8 = 0x12;
    pub const PROCESS_REMOVED: u8 = 0x13;
    pub const PROCESS_INVENTORY: u8 = 0x14;
    pub const PROCESS_RECONNECTED: u8 = 0x15;
    pub const OPERATION_FAILED: u8 = 0x16;
}

/// Codec errors for whole-message decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A primitive field failed to decode.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The frame was empty (no opcode byte).
    #[error("empty frame")]
    EmptyFrame,

    /// The opcode byte is not in the catalogue for this direction.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// An `AUTH` payload carried a token of the wrong length.
    #[error("auth token length {0}, expected {expected}", expected = TOKEN_LEN)]
    BadTokenLength(usize),
}

/// An inbound control request, decoded from one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Authentication handshake: protocol version plus the record's token.
    Auth { version: u8, token: Vec<u8> },

    /// Register a new process record.
    AddProcess {
        name: String,
        pid_hint: i32,
        command: Vec<String>,
        env: Vec<(String, String)>,
        working_dir: String,
    },

    /// Start a registered record.
    StartProcess { name: String },

    /// Graceful stop: close the record's stdin and wait for exit.
    StopProcess { name: String },

    /// Remove a `DOWN` record from the registry.
    RemoveProcess { name: String },

    /// Forward raw bytes to a record's stdin.
    SendStdin { name: String, payload: Vec<u8> },

    /// Snapshot of the fleet registry.
    RequestProcessInventory,

    /// Tell a child where to re-establish its management connection.
    ReconnectProcess {
        name: String,
        scheme: String,
        host: String,
        port: i32,
        management_endpoint: bool,
        auth_token: String,
    },

    /// Stop the whole fleet and exit the supervisor with the given code.
    Shutdown { exit_code: i32 },

    /// Forceful stop using the runtime's terminate primitive after the
    /// grace window.
    DestroyProcess { name: String },

    /// Hard stop using an OS kill signal after the grace window.
    KillProcess { name: String },
}

impl Request {
    /// The request's wire opcode.
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::Auth { .. } => op::AUTH,
            Self::AddProcess { .. } => op::ADD_PROCESS,
            Self::StartProcess { .. } => op::START_PROCESS,
            Self::StopProcess { .. } => op::STOP_PROCESS,
            Self::RemoveProcess { .. } => op::REMOVE_PROCESS,
            Self::SendStdin { .. } => op::SEND_STDIN,
            Self::RequestProcessInventory => op::REQUEST_PROCESS_INVENTORY,
            Self::ReconnectProcess { .. } => op::RECONNECT_PROCESS,
            Self::Shutdown { .. } => op::SHUTDOWN,
            Self::DestroyProcess { .. } => op::DESTROY_PROCESS,
            Self::KillProcess { .. } => op::KILL_PROCESS,
        }
    }

    /// The process name the request targets, if it targets one.
    ///
    /// Used for best-effort `OPERATION_FAILED` replies when a handler
    /// fails mid-operation.
    #[must_use]
    pub fn process_name(&self) -> Option<&str> {
        match self {
            Self::AddProcess { name, .. }
            | Self::StartProcess { name }
            | Self::StopProcess { name }
            | Self::RemoveProcess { name }
            | Self::SendStdin { name, .. }
            | Self::ReconnectProcess { name, .. }
            | Self::DestroyProcess { name }
            | Self::KillProcess { name } => Some(name),
            Self::Auth { .. } | Self::RequestProcessInventory | Self::Shutdown { .. } => None,
        }
    }

    /// Decode one frame into a request.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for an empty frame, an unknown opcode, or a
    /// malformed payload. The frame is rejected as a whole.
    pub fn decode(mut frame: Bytes) -> Result<Self, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        let opcode = frame[0];
        frame.advance(1);
        let buf = &mut frame;

        match opcode {
            op::AUTH => {
                let version = if buf.is_empty() {
                    return Err(CodecError::Wire(WireError::Truncated { needed: 1 }));
                } else {
                    let v = buf[0];
                    buf.advance(1);
                    v
                };
                if buf.len() != TOKEN_LEN {
                    return Err(CodecError::BadTokenLength(buf.len()));
                }
                Ok(Self::Auth {
                    version,
                    token: buf.to_vec(),
                })
            }
            op::ADD_PROCESS => {
                let name = get_string(buf)?;
                let pid_hint = get_int(buf)?;
                let argc = count_to_usize(get_int(buf)?)?;
                let mut command = Vec::with_capacity(argc.min(64));
                for _ in 0..argc {
                    command.push(get_string(buf)?);
                }
                let env_count = count_to_usize(get_int(buf)?)?;
                let mut env = Vec::with_capacity(env_count.min(64));
                for _ in 0..env_count {
                    let key = get_string(buf)?;
                    let value = get_string(buf)?;
                    env.push((key, value));
                }
                let working_dir = get_string(buf)?;
                Ok(Self::AddProcess {
                    name,
                    pid_hint,
                    command,
                    env,
                    working_dir,
                })
            }
            op::START_PROCESS => Ok(Self::StartProcess {
                name: get_string(buf)?,
            }),
            op::STOP_PROCESS => Ok(Self::StopProcess {
                name: get_string(buf)?,
            }),
            op::REMOVE_PROCESS => Ok(Self::RemoveProcess {
                name: get_string(buf)?,
            }),
            op::SEND_STDIN => {
                let name = get_string(buf)?;
                Ok(Self::SendStdin {
                    name,
                    payload: buf.to_vec(),
                })
            }
            op::REQUEST_PROCESS_INVENTORY => Ok(Self::RequestProcessInventory),
            op::RECONNECT_PROCESS => {
                let name = get_string(buf)?;
                let scheme = get_string(buf)?;
                let host = get_string(buf)?;
                let port = get_int(buf)?;
                let management_endpoint = get_bool(buf)?;
                let auth_token = get_string(buf)?;
                Ok(Self::ReconnectProcess {
                    name,
                    scheme,
                    host,
                    port,
                    management_endpoint,
                    auth_token,
                })
            }
            op::SHUTDOWN => Ok(Self::Shutdown {
                exit_code: get_int(buf)?,
            }),
            op::DESTROY_PROCESS => Ok(Self::DestroyProcess {
                name: get_string(buf)?,
            }),
            op::KILL_PROCESS => Ok(Self::KillProcess {
                name: get_string(buf)?,
            }),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }

    /// Encode the request into one frame payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.opcode());
        match self {
            Self::Auth { version, token } => {
                buf.put_u8(*version);
                buf.put_slice(token);
            }
            Self::AddProcess {
                name,
                pid_hint,
                command,
                env,
                working_dir,
            } => {
                put_string(&mut buf, name);
                put_int(&mut buf, *pid_hint);
                put_int(&mut buf, int_len(command.len()));
                for arg in command {
                    put_string(&mut buf, arg);
                }
                put_int(&mut buf, int_len(env.len()));
                for (key, value) in env {
                    put_string(&mut buf, key);
                    put_string(&mut buf, value);
                }
                put_string(&mut buf, working_dir);
            }
            Self::StartProcess { name }
            | Self::StopProcess { name }
            | Self::RemoveProcess { name }
            | Self::DestroyProcess { name }
            | Self::KillProcess { name } => put_string(&mut buf, name),
            Self::SendStdin { name, payload } => {
                put_string(&mut buf, name);
                buf.put_slice(payload);
            }
            Self::RequestProcessInventory => {}
            Self::ReconnectProcess {
                name,
                scheme,
                host,
                port,
                management_endpoint,
                auth_token,
            } => {
                put_string(&mut buf, name);
                put_string(&mut buf, scheme);
                put_string(&mut buf, host);
                put_int(&mut buf, *port);
                put_bool(&mut buf, *management_endpoint);
                put_string(&mut buf, auth_token);
            }
            Self::Shutdown { exit_code } => put_int(&mut buf, *exit_code),
        }
        buf.freeze()
    }
}

/// One entry of a [`Notification::ProcessInventory`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub name: String,
    /// The record's auth token bytes (always [`TOKEN_LEN`] long).
    pub token: Vec<u8>,
    pub running: bool,
    pub stopping: bool,
}

/// An outbound notification, encoded into one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ProcessAdded { name: String },
    ProcessStarted { name: String },
    ProcessStopped { name: String, uptime_millis: i64 },
    ProcessRemoved { name: String },
    ProcessInventory { entries: Vec<InventoryEntry> },
    ProcessReconnected { name: String },
    /// A privileged operation failed; `opcode` is the request opcode that
    /// triggered it.
    OperationFailed { opcode: u8, name: String },
}

impl Notification {
    /// The notification's wire opcode.
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::ProcessAdded { .. } => notify_op::PROCESS_ADDED,
            Self::ProcessStarted { .. } => notify_op::PROCESS_STARTED,
            Self::ProcessStopped { .. } => notify_op::PROCESS_STOPPED,
            Self::ProcessRemoved { .. } => notify_op::PROCESS_REMOVED,
            Self::ProcessInventory { .. } => notify_op::PROCESS_INVENTORY,
            Self::ProcessReconnected { .. } => notify_op::PROCESS_RECONNECTED,
            Self::OperationFailed { .. } => notify_op::OPERATION_FAILED,
        }
    }

    /// Encode the notification into one frame payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.opcode());
        match self {
            Self::ProcessAdded { name }
            | Self::ProcessStarted { name }
            | Self::ProcessRemoved { name }
            | Self::ProcessReconnected { name } => put_string(&mut buf, name),
            Self::ProcessStopped {
                name,
                uptime_millis,
            } => {
                put_string(&mut buf, name);
                put_long(&mut buf, *uptime_millis);
            }
            Self::ProcessInventory { entries } => {
                put_int(&mut buf, int_len(entries.len()));
                for entry in entries {
                    put_string(&mut buf, &entry.name);
                    buf.put_slice(&entry.token);
                    put_bool(&mut buf, entry.running);
                    put_bool(&mut buf, entry.stopping);
                }
            }
            Self::OperationFailed { opcode, name } => {
                buf.put_u8(*opcode);
                put_string(&mut buf, name);
            }
        }
        buf.freeze()
    }

    /// Decode one frame into a notification (client side of the protocol).
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for an empty frame, an unknown opcode, or a
    /// malformed payload.
    pub fn decode(mut frame: Bytes) -> Result<Self, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        let opcode = frame[0];
        frame.advance(1);
        let buf = &mut frame;

        match opcode {
            notify_op::PROCESS_ADDED => Ok(Self::ProcessAdded {
                name: get_string(buf)?,
            }),
            notify_op::PROCESS_STARTED => Ok(Self::ProcessStarted {
                name: get_string(buf)?,
            }),
            notify_op::PROCESS_STOPPED => Ok(Self::ProcessStopped {
                name: get_string(buf)?,
                uptime_millis: get_long(buf)?,
            }),
            notify_op::PROCESS_REMOVED => Ok(Self::ProcessRemoved {
                name: get_string(buf)?,
            }),
            notify_op::PROCESS_INVENTORY => {
                let count = count_to_usize(get_int(buf)?)?;
                let mut entries = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let name = get_string(buf)?;
                    if buf.len() < TOKEN_LEN {
                        return Err(CodecError::Wire(WireError::Truncated {
                            needed: TOKEN_LEN - buf.len(),
                        }));
                    }
                    let token = buf.split_to(TOKEN_LEN).to_vec();
                    let running = get_bool(buf)?;
                    let stopping = get_bool(buf)?;
                    entries.push(InventoryEntry {
                        name,
                        token,
                        running,
                        stopping,
                    });
                }
                Ok(Self::ProcessInventory { entries })
            }
            notify_op::PROCESS_RECONNECTED => Ok(Self::ProcessReconnected {
                name: get_string(buf)?,
            }),
            notify_op::OPERATION_FAILED => {
                if buf.is_empty() {
                    return Err(CodecError::Wire(WireError::Truncated { needed: 1 }));
                }
                let failed_opcode = buf[0];
                buf.advance(1);
                Ok(Self::OperationFailed {
                    opcode: failed_opcode,
                    name: get_string(buf)?,
                })
            }
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }
}

/// Clamp a collection length into the protocol's signed count field.
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn int_len(len: usize) -> i32 {
    // Registry sizes are tiny; saturate rather than wrap on absurd input.
    len.min(i32::MAX as usize) as i32
}
