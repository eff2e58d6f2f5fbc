//! Per-record actor: owns the OS child and its lifecycle state machine.
//!
//! One actor task exists per process record. It is the only owner of the
//! `tokio::process::Child` handle, the stdin writer, and the state machine:
//!
//! ```text
//!   DOWN ──start──► STARTED ──stop/destroy/kill──► STOPPING ──exit──► DOWN
//!            ▲                                                  │
//!            └────────────────── (respawn) ◄────────────────────┘
//! ```
//!
//! The registry talks to the actor over a command channel and observes it
//! through a state watch; exits are reported on the shared event channel.
//! Commands invalid for the current state are logged and ignored rather
//! than failed.
//!
//! `destroy` and `kill` first behave like a graceful stop, then escalate
//! after the grace window: `destroy` through the runtime's kill primitive,
//! `kill` through a raw `SIGKILL` to the saved pid. All waiting goes
//! through the injected [`Clock`].

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use procfleet_core::{stdin_frame, AuthToken, ProcessSpec, RESTART_MARKER};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::relay::{LogLine, LogStream};

const COMMAND_BUFFER: usize = 32;

// Spawn generations are drawn from one daemon-wide counter so a removed
// record re-registered under the same name can never reuse a generation
// the relay still has state for.
static SPAWN_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a process record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Down,
    Started,
    Stopping,
}

/// Snapshot published through the record's state watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStatus {
    pub state: RecordState,
    pub pid: Option<u32>,
}

impl RecordStatus {
    const DOWN: Self = Self {
        state: RecordState::Down,
        pid: None,
    };

    #[must_use]
    pub const fn is_running(&self) -> bool {
        !matches!(self.state, RecordState::Down)
    }

    #[must_use]
    pub const fn is_stopping(&self) -> bool {
        matches!(self.state, RecordState::Stopping)
    }
}

/// Errors writing to a record's stdin.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("process is not running")]
    NotRunning,

    #[error("stdin pipe already closed")]
    PipeClosed,

    #[error("record actor is gone")]
    ActorGone,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Commands accepted by the record actor.
enum RecordCommand {
    Start {
        restarted: bool,
        reply: oneshot::Sender<io::Result<u32>>,
    },
    Stop,
    Destroy,
    Kill,
    /// A payload base64-framed onto the child's stdin.
    SendStdin {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), WriteError>>,
    },
    Close,
}

/// Exit report delivered to the registry.
#[derive(Debug)]
pub struct ExitEvent {
    pub name: String,
    /// Spawn generation that exited.
    pub generation: u64,
    /// Exit code, or `None` when killed by signal.
    pub exit_code: Option<i32>,
    pub uptime: Duration,
    /// Whether the exit followed an operator stop/destroy/kill.
    pub stop_requested: bool,
}

/// Handle through which the registry drives one record actor.
#[derive(Debug, Clone)]
pub struct RecordHandle {
    cmd_tx: mpsc::Sender<RecordCommand>,
    status_rx: watch::Receiver<RecordStatus>,
}

impl RecordHandle {
    /// Spawn the child. Returns its pid, or the OS spawn error.
    ///
    /// # Errors
    ///
    /// Propagates the spawn failure; state remains `DOWN`.
    pub async fn start(&self, restarted: bool) -> io::Result<u32> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RecordCommand::Start { restarted, reply })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "record actor is gone"))?;
        rx.await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "record actor is gone"))?
    }

    /// Request a graceful stop. No-op unless `STARTED`.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(RecordCommand::Stop).await;
    }

    /// Graceful stop, escalating through the runtime's kill primitive
    /// after the grace window.
    pub async fn destroy(&self) {
        let _ = self.cmd_tx.send(RecordCommand::Destroy).await;
    }

    /// Graceful stop, escalating to a raw `SIGKILL` after the grace window.
    pub async fn kill(&self) {
        let _ = self.cmd_tx.send(RecordCommand::Kill).await;
    }

    /// Deliver a payload to the child's stdin, base64-framed the same way
    /// as the auth token.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if the record is down, the pipe is closed,
    /// or the write itself fails.
    pub async fn send_stdin(&self, payload: Vec<u8>) -> Result<(), WriteError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RecordCommand::SendStdin { payload, reply })
            .await
            .map_err(|_| WriteError::ActorGone)?;
        rx.await.map_err(|_| WriteError::ActorGone)?
    }

    /// Current lifecycle snapshot.
    #[must_use]
    pub fn status(&self) -> RecordStatus {
        *self.status_rx.borrow()
    }

    /// Watch receiver for state transitions.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<RecordStatus> {
        self.status_rx.clone()
    }

    /// Tear the actor down. Valid only once the record is `DOWN`.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(RecordCommand::Close).await;
    }
}

/// Start a record actor for `spec` and return its handle.
#[must_use]
pub fn spawn_record(
    spec: ProcessSpec,
    token: AuthToken,
    grace: Duration,
    clock: Arc<dyn Clock>,
    log_tx: mpsc::Sender<LogLine>,
    event_tx: mpsc::Sender<ExitEvent>,
) -> RecordHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (status_tx, status_rx) = watch::channel(RecordStatus::DOWN);
    let actor = RecordActor {
        spec,
        token,
        grace,
        clock,
        log_tx,
        event_tx,
        status_tx,
        cmd_rx,
        generation: 0,
    };
    tokio::spawn(actor.run());
    RecordHandle { cmd_tx, status_rx }
}

/// How an armed grace window escalates when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    Destroy,
    Kill,
}

enum LoopEvent {
    Exited(io::Result<std::process::ExitStatus>),
    Command(Option<RecordCommand>),
    GraceExpired,
}

struct RecordActor {
    spec: ProcessSpec,
    token: AuthToken,
    grace: Duration,
    clock: Arc<dyn Clock>,
    log_tx: mpsc::Sender<LogLine>,
    event_tx: mpsc::Sender<ExitEvent>,
    status_tx: watch::Sender<RecordStatus>,
    cmd_rx: mpsc::Receiver<RecordCommand>,
    generation: u64,
}

impl RecordActor {
    async fn run(mut self) {
        loop {
            // DOWN: only start and close do anything.
            let Some(command) = self.cmd_rx.recv().await else {
                return;
            };
            match command {
                RecordCommand::Start { restarted, reply } => {
                    match self.spawn_child(restarted) {
                        Ok(child) => {
                            let pid = child.id();
                            // Publish STARTED before replying, so a caller
                            // that saw Ok never observes the record as down.
                            let _ = self.status_tx.send(RecordStatus {
                                state: RecordState::Started,
                                pid,
                            });
                            let _ = reply.send(Ok(pid.unwrap_or_default()));
                            if !self.supervise(child).await {
                                return;
                            }
                        }
                        Err(error) => {
                            warn!(process = %self.spec.name, %error, "spawn failed");
                            let _ = reply.send(Err(error));
                        }
                    }
                }
                RecordCommand::Stop | RecordCommand::Destroy | RecordCommand::Kill => {
                    debug!(process = %self.spec.name, "stop request ignored, record is down");
                }
                RecordCommand::SendStdin { reply, .. } => {
                    let _ = reply.send(Err(WriteError::NotRunning));
                }
                RecordCommand::Close => return,
            }
        }
    }

    fn spawn_child(&mut self, restarted: bool) -> io::Result<Child> {
        let mut command = Command::new(self.spec.program());
        command.args(self.spec.argv());
        if restarted && !self.spec.has_restart_marker() {
            command.arg(RESTART_MARKER);
        }
        for (key, value) in &self.spec.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        let child = command.spawn()?;
        self.generation = SPAWN_GENERATION.fetch_add(1, Ordering::Relaxed);
        info!(
            process = %self.spec.name,
            pid = child.id(),
            generation = self.generation,
            "process spawned"
        );
        Ok(child)
    }

    /// Supervise one spawn until exit. Returns `false` when the command
    /// channel closed and the actor should stop entirely.
    async fn supervise(&mut self, mut child: Child) -> bool {
        let pid = child.id();
        self.spawn_reader(LogStream::Stdout, child.stdout.take());
        self.spawn_reader(LogStream::Stderr, child.stderr.take());
        let mut stdin = child.stdin.take();

        // The auth token is always the first message on the child's stdin.
        if let Some(pipe) = stdin.as_mut() {
            if let Err(error) = write_framed(pipe, self.token.as_bytes()).await {
                warn!(process = %self.spec.name, %error, "token delivery failed");
            }
        }

        let started_at = self.clock.now();
        let mut stop_requested = false;
        let mut escalation: Option<Escalation> = None;
        let mut grace_timer: Option<Pin<Box<dyn Future<Output = ()> + Send>>> = None;
        let mut channel_open = true;

        let exit_status = loop {
            let event = tokio::select! {
                status = child.wait() => LoopEvent::Exited(status),
                command = self.cmd_rx.recv(), if channel_open => LoopEvent::Command(command),
                () = async {
                    match grace_timer.as_mut() {
                        Some(timer) => timer.as_mut().await,
                        None => std::future::pending::<()>().await,
                    }
                } => LoopEvent::GraceExpired,
            };

            match event {
                LoopEvent::Exited(status) => break status,
                LoopEvent::Command(None) => {
                    // Registry is gone; take the child down with us.
                    channel_open = false;
                    let _ = child.start_kill();
                }
                LoopEvent::Command(Some(command)) => match command {
                    RecordCommand::Start { reply, .. } => {
                        debug!(process = %self.spec.name, "start ignored, already running");
                        let _ = reply.send(Err(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            "process already running",
                        )));
                    }
                    RecordCommand::Stop => {
                        self.begin_stop(&mut stop_requested, &mut stdin, pid);
                    }
                    RecordCommand::Destroy => {
                        self.begin_stop(&mut stop_requested, &mut stdin, pid);
                        if escalation.is_none() {
                            grace_timer = Some(self.clock.sleep(self.grace));
                        }
                        if escalation != Some(Escalation::Kill) {
                            escalation = Some(Escalation::Destroy);
                        }
                    }
                    RecordCommand::Kill => {
                        self.begin_stop(&mut stop_requested, &mut stdin, pid);
                        if escalation.is_none() {
                            grace_timer = Some(self.clock.sleep(self.grace));
                        }
                        escalation = Some(Escalation::Kill);
                    }
                    RecordCommand::SendStdin { payload, reply } => {
                        let result = match stdin.as_mut() {
                            Some(pipe) => write_framed(pipe, &payload).await,
                            None => Err(WriteError::PipeClosed),
                        };
                        let _ = reply.send(result);
                    }
                    RecordCommand::Close => {
                        debug!(process = %self.spec.name, "close ignored, record is running");
                    }
                },
                LoopEvent::GraceExpired => {
                    grace_timer = None;
                    match escalation.take() {
                        Some(Escalation::Destroy) => {
                            warn!(process = %self.spec.name, "grace expired, destroying process");
                            let _ = child.start_kill();
                        }
                        Some(Escalation::Kill) => {
                            warn!(process = %self.spec.name, "grace expired, killing process");
                            if let Some(pid) = pid {
                                #[allow(clippy::cast_possible_wrap)]
                                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                            } else {
                                let _ = child.start_kill();
                            }
                        }
                        None => {}
                    }
                }
            }
        };

        let uptime = self.clock.now() - started_at;
        let exit_code = match exit_status {
            Ok(status) => status.code(),
            Err(error) => {
                warn!(process = %self.spec.name, %error, "wait on child failed");
                None
            }
        };
        info!(
            process = %self.spec.name,
            exit_code,
            uptime_ms = u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
            stop_requested,
            "process exited"
        );

        let _ = self.status_tx.send(RecordStatus::DOWN);
        let _ = self
            .event_tx
            .send(ExitEvent {
                name: self.spec.name.clone(),
                generation: self.generation,
                exit_code,
                uptime,
                stop_requested,
            })
            .await;
        channel_open
    }

    fn begin_stop(
        &self,
        stop_requested: &mut bool,
        stdin: &mut Option<ChildStdin>,
        pid: Option<u32>,
    ) {
        if !*stop_requested {
            info!(process = %self.spec.name, pid, "stopping process");
            *stop_requested = true;
        }
        // Closing stdin is the graceful-shutdown signal.
        stdin.take();
        let _ = self.status_tx.send(RecordStatus {
            state: RecordState::Stopping,
            pid,
        });
    }

    fn spawn_reader<R>(&self, stream: LogStream, reader: Option<R>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Some(reader) = reader else { return };
        let process = self.spec.name.clone();
        let generation = self.generation;
        let log_tx = self.log_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let entry = LogLine {
                            process: process.clone(),
                            generation,
                            stream,
                            line,
                        };
                        if log_tx.send(entry).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        debug!(process = %process, ?stream, %error, "relay read failed");
                        break;
                    }
                }
            }
        });
    }
}

async fn write_framed(pipe: &mut ChildStdin, payload: &[u8]) -> Result<(), WriteError> {
    let frame = stdin_frame::encode_frame(payload);
    pipe.write_all(&frame).await?;
    pipe.flush().await?;
    Ok(())
}
