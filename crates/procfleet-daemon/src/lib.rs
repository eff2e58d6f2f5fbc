//! procfleet bootstrap supervisor daemon.
//!
//! The daemon launches a fixed fleet of local child processes, relays their
//! output, respawns them per policy, and serves an authenticated control
//! protocol on a loopback TCP socket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      procfleetd                          │
//! │                                                          │
//! │  ControlServer ──accept──► session task (per conn)       │
//! │        │                        │                        │
//! │        │                 SupervisorHandle                │
//! │        │                        │                        │
//! │        │              registry (owned by handle)         │
//! │        │               │      │        │                 │
//! │        │          record    record   record              │
//! │        │          actor     actor    actor               │
//! │        │            │         │        │                 │
//! │        │          child     child    child               │
//! │        │            └────┬────┴────────┘                 │
//! │        │                 ▼                               │
//! │        │          relay writer task                      │
//! │        │       (stdout/stderr, line atomic)              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Each process record runs as its own actor task owning the child handle;
//! the registry talks to it over a command channel and observes it through
//! a state watch. All relayed output funnels through one writer task so
//! lines from different children never interleave mid-line.

pub mod clock;
pub mod protocol;
pub mod relay;
pub mod supervisor;
