//! Output relay: child stdout/stderr onto the daemon's own streams.
//!
//! Per-child reader tasks (started by the record actor) push whole lines
//! into one channel; a single writer task owns the daemon's stdout and
//! stderr and is the only thing that writes to them, so lines from
//! different children never interleave mid-line.
//!
//! Each (process, stream) pair has its own relay state with two modes:
//!
//! - **log** (default): lines are prefixed with `[<name>] `. A trailing
//!   ANSI color escape left open at end of line is reset before the
//!   newline and re-opened at the start of the next line, so colors
//!   survive the prefixing without bleeding into other children's output.
//! - **passthrough**: entered permanently for the rest of the spawn when a
//!   line contains [`LOG_REDIRECT_SENTINEL`]; the child has installed its
//!   own logging and its lines are forwarded verbatim, no prefix.
//!
//! Mode and carry state reset whenever the spawn generation changes.

use std::collections::HashMap;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Sentinel substring a child emits once it has redirected its own logging.
pub const LOG_REDIRECT_SENTINEL: &str = "[[procfleet:log-redirect]]";

const ANSI_RESET: &str = "\x1b[0m";

/// Which of the child's streams a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line read from a child, as queued for the writer task.
#[derive(Debug)]
pub struct LogLine {
    /// Record name of the child.
    pub process: String,
    /// Spawn generation, unique across all records; relay state resets
    /// when it changes.
    pub generation: u64,
    pub stream: LogStream,
    /// The line text, terminator stripped.
    pub line: String,
}

/// What a line's SGR escapes leave behind at end of line.
enum SgrOutcome {
    /// No SGR sequence in the line.
    Untouched,
    /// The last SGR was a reset.
    Reset,
    /// The last SGR opened an attribute that was never reset.
    Open(String),
}

/// Scan a line for ANSI SGR sequences and report the final state.
fn scan_sgr(line: &str) -> SgrOutcome {
    let mut outcome = SgrOutcome::Untouched;
    let bytes = line.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == 0x1b && bytes[i + 1] == b'[' {
            let rest = &bytes[i + 2..];
            if let Some(end) = rest.iter().position(u8::is_ascii_alphabetic) {
                let term = i + 2 + end;
                if bytes[term] == b'm' {
                    let params = &line[i + 2..term];
                    let is_reset =
                        params.is_empty() || params.split(';').all(|p| p.is_empty() || p == "0");
                    outcome = if is_reset {
                        SgrOutcome::Reset
                    } else {
                        SgrOutcome::Open(line[i..=term].to_string())
                    };
                }
                i = term + 1;
                continue;
            }
        }
        i += 1;
    }
    outcome
}

/// Per-(process, stream) relay state.
#[derive(Debug, Default)]
struct StreamState {
    generation: u64,
    passthrough: bool,
    carry: Option<String>,
}

impl StreamState {
    fn render(&mut self, process: &str, generation: u64, line: &str) -> Option<String> {
        if generation != self.generation {
            self.generation = generation;
            self.passthrough = false;
            self.carry = None;
        }

        if self.passthrough {
            return Some(line.to_string());
        }

        if line.contains(LOG_REDIRECT_SENTINEL) {
            self.passthrough = true;
            self.carry = None;
            return None;
        }

        let mut rendered = String::with_capacity(line.len() + process.len() + 8);
        rendered.push('[');
        rendered.push_str(process);
        rendered.push_str("] ");
        if let Some(carry) = &self.carry {
            rendered.push_str(carry);
        }
        rendered.push_str(line);

        match scan_sgr(line) {
            SgrOutcome::Untouched => {}
            SgrOutcome::Reset => self.carry = None,
            SgrOutcome::Open(seq) => self.carry = Some(seq),
        }
        if self.carry.is_some() {
            rendered.push_str(ANSI_RESET);
        }
        Some(rendered)
    }
}

/// Formatting state for every stream funneled through the writer.
#[derive(Debug, Default)]
pub struct RelayFormatter {
    states: HashMap<(String, LogStream), StreamState>,
}

impl RelayFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Render one queued line, or `None` if the line is consumed (the
    /// sentinel that switches the stream to passthrough).
    pub fn render(&mut self, entry: &LogLine) -> Option<String> {
        self.states
            .entry((entry.process.clone(), entry.stream))
            .or_default()
            .render(&entry.process, entry.generation, &entry.line)
    }
}

/// Start the single writer task and return the line channel feeding it.
///
/// The task exits when every sender is dropped.
#[must_use]
pub fn spawn_writer(buffer: usize) -> (mpsc::Sender<LogLine>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<LogLine>(buffer);
    let handle = tokio::spawn(async move {
        let mut formatter = RelayFormatter::new();
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();

        while let Some(entry) = rx.recv().await {
            let Some(mut rendered) = formatter.render(&entry) else {
                trace!(process = %entry.process, "output redirect sentinel observed");
                continue;
            };
            rendered.push('\n');
            let result = match entry.stream {
                LogStream::Stdout => {
                    let r = stdout.write_all(rendered.as_bytes()).await;
                    if r.is_ok() {
                        stdout.flush().await
                    } else {
                        r
                    }
                }
                LogStream::Stderr => {
                    let r = stderr.write_all(rendered.as_bytes()).await;
                    if r.is_ok() {
                        stderr.flush().await
                    } else {
                        r
                    }
                }
            };
            if let Err(error) = result {
                // Our own console went away; nothing sensible left to do
                // with relay output.
                trace!(%error, "relay write failed");
            }
        }
    });
    (tx, handle)
}
