//! Fleet registry and exit policy.
//!
//! The supervisor is one actor task owning the name→record map. Everything
//! else (sessions, the bootstrap entry point, respawn timers) talks to it
//! through a [`SupervisorHandle`]; record actors report exits back on a
//! shared event channel. No registry state is shared or locked.
//!
//! # Exit policy
//!
//! When a record's child exits, the registry decides what happens next, in
//! order:
//!
//! 1. shutdown in progress, or the record was marked for removal: the
//!    record is removed; once the registry is empty the daemon's exit code
//!    resolves.
//! 2. the privileged record exited with the controller-abort code: if any
//!    other record is still running the controller is respawned with
//!    unlimited, slow retries and the restart marker appended to its
//!    command line (the fleet needs its controller back); with nothing
//!    else running it is treated as a deliberate full shutdown.
//! 3. the privileged record exited with the restart-requested code: the
//!    daemon itself exits with that code so an outer wrapper relaunches
//!    the whole stack.
//! 4. an unrequested exit with respawn enabled: respawn with backoff,
//!    capped unless the privileged record still has live dependents.
//!
//! Anything else leaves the record `DOWN` until an operator acts.

pub mod record;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use procfleet_core::protocol::{op, InventoryEntry, Notification};
use procfleet_core::{
    AuthToken, ProcessSpec, RespawnDirective, RespawnPolicy, RespawnTracker, CONTROLLER_ABORT_EXIT,
    RESTART_REQUESTED_EXIT,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::relay::LogLine;
use record::{spawn_record, ExitEvent, RecordHandle, WriteError};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 64;

/// Default grace window before forced termination.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub respawn_policy: RespawnPolicy,
    pub grace_period: Duration,
}

impl SupervisorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_respawn_policy(mut self, policy: RespawnPolicy) -> Self {
        self.respawn_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            respawn_policy: RespawnPolicy::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Errors surfaced by supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no process named {0:?} is registered")]
    UnknownProcess(String),

    #[error("a process named {0:?} is already registered")]
    DuplicateName(String),

    #[error("failed to spawn process {name:?}")]
    SpawnFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("stdin write to process {name:?} failed")]
    StdinWrite {
        name: String,
        #[source]
        source: WriteError,
    },

    #[error("supervisor task is gone")]
    Terminated,
}

/// What a successful authentication grants a connection.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    /// Name of the record the token belongs to.
    pub name: String,
    /// Whether the session may drive fleet control.
    pub privileged: bool,
}

enum SupervisorCommand {
    AddProcess {
        spec: ProcessSpec,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    StartProcess {
        name: String,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    StopProcess {
        name: String,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    RemoveProcess {
        name: String,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    DestroyProcess {
        name: String,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    KillProcess {
        name: String,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    SendStdin {
        name: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Inventory {
        reply: oneshot::Sender<Vec<InventoryEntry>>,
    },
    Authenticate {
        token: Vec<u8>,
        notifications: mpsc::Sender<Notification>,
        reply: oneshot::Sender<Option<AuthGrant>>,
    },
    Shutdown {
        exit_code: i32,
    },
    RespawnFire {
        name: String,
        generation: u64,
    },
}

/// Cloneable handle to the supervisor actor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl SupervisorHandle {
    /// Start the supervisor actor.
    #[must_use]
    pub fn spawn(
        config: SupervisorConfig,
        clock: Arc<dyn Clock>,
        log_tx: mpsc::Sender<LogLine>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (exit_tx, exit_rx) = watch::channel(None);
        let registry = Registry {
            config,
            clock,
            log_tx,
            records: HashMap::new(),
            subscribers: Vec::new(),
            event_tx,
            shutting_down: false,
            pending_exit_code: 0,
            exit_tx,
            self_tx: cmd_tx.clone(),
        };
        tokio::spawn(registry.run(cmd_rx, event_rx));
        Self { cmd_tx, exit_rx }
    }

    /// Register a new record. Does not start it.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::DuplicateName`] if the name is taken.
    pub async fn add_process(&self, spec: ProcessSpec) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::AddProcess { spec, reply })
            .await?
    }

    /// Start a registered record.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::UnknownProcess`] or [`SupervisorError::SpawnFailed`].
    pub async fn start_process(&self, name: impl Into<String>) -> Result<(), SupervisorError> {
        let name = name.into();
        self.request(|reply| SupervisorCommand::StartProcess { name, reply })
            .await?
    }

    /// Request a graceful stop.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::UnknownProcess`].
    pub async fn stop_process(&self, name: impl Into<String>) -> Result<(), SupervisorError> {
        let name = name.into();
        self.request(|reply| SupervisorCommand::StopProcess { name, reply })
            .await?
    }

    /// Remove a `DOWN` record from the registry.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::UnknownProcess`].
    pub async fn remove_process(&self, name: impl Into<String>) -> Result<(), SupervisorError> {
        let name = name.into();
        self.request(|reply| SupervisorCommand::RemoveProcess { name, reply })
            .await?
    }

    /// Stop, escalating through the runtime kill primitive after the grace
    /// window.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::UnknownProcess`].
    pub async fn destroy_process(&self, name: impl Into<String>) -> Result<(), SupervisorError> {
        let name = name.into();
        self.request(|reply| SupervisorCommand::DestroyProcess { name, reply })
            .await?
    }

    /// Stop, escalating to a raw OS kill signal after the grace window.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::UnknownProcess`].
    pub async fn kill_process(&self, name: impl Into<String>) -> Result<(), SupervisorError> {
        let name = name.into();
        self.request(|reply| SupervisorCommand::KillProcess { name, reply })
            .await?
    }

    /// Deliver a base64-framed payload to a record's stdin.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::UnknownProcess`] or [`SupervisorError::StdinWrite`].
    pub async fn send_stdin(
        &self,
        name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<(), SupervisorError> {
        let name = name.into();
        self.request(|reply| SupervisorCommand::SendStdin {
            name,
            payload,
            reply,
        })
        .await?
    }

    /// Snapshot of every registered record.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Terminated`] if the actor is gone.
    pub async fn inventory(&self) -> Result<Vec<InventoryEntry>, SupervisorError> {
        self.request(|reply| SupervisorCommand::Inventory { reply })
            .await
    }

    /// Authenticate a connection by token.
    ///
    /// On success the record's respawn counter resets and `notifications`
    /// joins the outbound fan-out set.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Terminated`] if the actor is gone. A token miss
    /// is `Ok(None)`, not an error; the caller closes silently.
    pub async fn authenticate(
        &self,
        token: Vec<u8>,
        notifications: mpsc::Sender<Notification>,
    ) -> Result<Option<AuthGrant>, SupervisorError> {
        self.request(|reply| SupervisorCommand::Authenticate {
            token,
            notifications,
            reply,
        })
        .await
    }

    /// Stop every record and resolve the daemon exit code. Idempotent.
    pub async fn shutdown(&self, exit_code: i32) {
        let _ = self
            .cmd_tx
            .send(SupervisorCommand::Shutdown { exit_code })
            .await;
    }

    /// Wait for the daemon exit code to resolve.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut exit_rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *exit_rx.borrow_and_update() {
                return code;
            }
            if exit_rx.changed().await.is_err() {
                return 0;
            }
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::Terminated)?;
        rx.await.map_err(|_| SupervisorError::Terminated)
    }
}

struct RecordEntry {
    spec: ProcessSpec,
    token: AuthToken,
    handle: RecordHandle,
    tracker: RespawnTracker,
    remove_on_down: bool,
    /// Delayed respawn armed for a specific exit, if any.
    pending_respawn: Option<PendingRespawn>,
}

#[derive(Debug, Clone, Copy)]
struct PendingRespawn {
    /// Exit generation the respawn was scheduled for.
    generation: u64,
    /// Whether the relaunch appends the restart marker (abort recovery).
    marker: bool,
}

struct Registry {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    log_tx: mpsc::Sender<LogLine>,
    records: HashMap<String, RecordEntry>,
    subscribers: Vec<mpsc::Sender<Notification>>,
    event_tx: mpsc::Sender<ExitEvent>,
    shutting_down: bool,
    pending_exit_code: i32,
    exit_tx: watch::Sender<Option<i32>>,
    self_tx: mpsc::Sender<SupervisorCommand>,
}

impl Registry {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SupervisorCommand>,
        mut event_rx: mpsc::Receiver<ExitEvent>,
    ) {
        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                // The registry keeps one event sender alive, so this arm
                // never yields None while the loop runs.
                Some(event) = event_rx.recv() => self.handle_exit(event).await,
            }
        }
    }

    async fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::AddProcess { spec, reply } => {
                let _ = reply.send(self.add_process(spec));
            }
            SupervisorCommand::StartProcess { name, reply } => {
                let _ = reply.send(self.start_process(&name, false).await);
            }
            SupervisorCommand::StopProcess { name, reply } => {
                let result = match self.records.get(&name) {
                    Some(entry) => {
                        if entry.handle.status().is_running() {
                            entry.handle.stop().await;
                        } else {
                            debug!(process = %name, "stop ignored, record is down");
                        }
                        Ok(())
                    }
                    None => Err(SupervisorError::UnknownProcess(name)),
                };
                let _ = reply.send(result);
            }
            SupervisorCommand::DestroyProcess { name, reply } => {
                let result = match self.records.get(&name) {
                    Some(entry) => {
                        entry.handle.destroy().await;
                        Ok(())
                    }
                    None => Err(SupervisorError::UnknownProcess(name)),
                };
                let _ = reply.send(result);
            }
            SupervisorCommand::KillProcess { name, reply } => {
                let result = match self.records.get(&name) {
                    Some(entry) => {
                        entry.handle.kill().await;
                        Ok(())
                    }
                    None => Err(SupervisorError::UnknownProcess(name)),
                };
                let _ = reply.send(result);
            }
            SupervisorCommand::RemoveProcess { name, reply } => {
                let result = match self.records.get(&name) {
                    Some(entry) => Ok(entry.handle.status().is_running()),
                    None => Err(SupervisorError::UnknownProcess(name.clone())),
                };
                let result = match result {
                    Ok(true) => {
                        debug!(process = %name, "remove ignored, record is running");
                        Ok(())
                    }
                    Ok(false) => {
                        self.remove_record(&name).await;
                        Ok(())
                    }
                    Err(error) => Err(error),
                };
                let _ = reply.send(result);
            }
            SupervisorCommand::SendStdin {
                name,
                payload,
                reply,
            } => {
                let result = match self.records.get(&name) {
                    Some(entry) => entry
                        .handle
                        .send_stdin(payload)
                        .await
                        .map_err(|source| SupervisorError::StdinWrite {
                            name: name.clone(),
                            source,
                        }),
                    None => Err(SupervisorError::UnknownProcess(name)),
                };
                let _ = reply.send(result);
            }
            SupervisorCommand::Inventory { reply } => {
                let entries = self
                    .records
                    .values()
                    .map(|entry| {
                        let status = entry.handle.status();
                        InventoryEntry {
                            name: entry.spec.name.clone(),
                            token: entry.token.as_bytes().to_vec(),
                            running: status.is_running(),
                            stopping: status.is_stopping(),
                        }
                    })
                    .collect();
                let _ = reply.send(entries);
            }
            SupervisorCommand::Authenticate {
                token,
                notifications,
                reply,
            } => {
                let grant = self.authenticate(&token, notifications);
                let _ = reply.send(grant);
            }
            SupervisorCommand::Shutdown { exit_code } => {
                self.begin_shutdown(exit_code).await;
            }
            SupervisorCommand::RespawnFire { name, generation } => {
                self.fire_respawn(&name, generation).await;
            }
        }
    }

    fn add_process(&mut self, spec: ProcessSpec) -> Result<(), SupervisorError> {
        if self.records.contains_key(&spec.name) {
            return Err(SupervisorError::DuplicateName(spec.name));
        }
        let name = spec.name.clone();
        let token = AuthToken::generate();
        let handle = spawn_record(
            spec.clone(),
            token.clone(),
            self.config.grace_period,
            Arc::clone(&self.clock),
            self.log_tx.clone(),
            self.event_tx.clone(),
        );
        self.records.insert(
            name.clone(),
            RecordEntry {
                spec,
                token,
                handle,
                tracker: RespawnTracker::new(self.config.respawn_policy.clone()),
                remove_on_down: false,
                pending_respawn: None,
            },
        );
        info!(process = %name, "process registered");
        self.broadcast(Notification::ProcessAdded { name });
        Ok(())
    }

    async fn start_process(&mut self, name: &str, restarted: bool) -> Result<(), SupervisorError> {
        let Some(entry) = self.records.get(name) else {
            return Err(SupervisorError::UnknownProcess(name.to_string()));
        };
        let handle = entry.handle.clone();
        if handle.status().is_running() {
            debug!(process = %name, "start ignored, already running");
            return Ok(());
        }
        match handle.start(restarted).await {
            Ok(_pid) => {
                self.broadcast(Notification::ProcessStarted {
                    name: name.to_string(),
                });
                Ok(())
            }
            Err(source) => Err(SupervisorError::SpawnFailed {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn authenticate(
        &mut self,
        token: &[u8],
        notifications: mpsc::Sender<Notification>,
    ) -> Option<AuthGrant> {
        let entry = self
            .records
            .values_mut()
            .find(|entry| entry.token.matches(token))?;
        entry.tracker.reset();
        let grant = AuthGrant {
            name: entry.spec.name.clone(),
            privileged: entry.spec.privileged,
        };
        info!(process = %grant.name, privileged = grant.privileged, "connection authenticated");
        self.subscribers.push(notifications);
        Some(grant)
    }

    async fn begin_shutdown(&mut self, exit_code: i32) {
        if self.shutting_down {
            return;
        }
        info!(exit_code, "supervisor shutdown requested");
        self.shutting_down = true;
        self.pending_exit_code = exit_code;

        let names: Vec<String> = self.records.keys().cloned().collect();
        for name in names {
            let running = self
                .records
                .get(&name)
                .is_some_and(|entry| entry.handle.status().is_running());
            if running {
                if let Some(entry) = self.records.get_mut(&name) {
                    entry.remove_on_down = true;
                    entry.handle.stop().await;
                }
            } else {
                self.remove_record(&name).await;
            }
        }
        self.finish_if_drained();
    }

    async fn fire_respawn(&mut self, name: &str, generation: u64) {
        let armed = match self.records.get_mut(name) {
            Some(entry) => match entry.pending_respawn {
                Some(pending) if pending.generation == generation => {
                    entry.pending_respawn = None;
                    if self.shutting_down || entry.handle.status().is_running() {
                        None
                    } else {
                        Some(pending.marker)
                    }
                }
                // Superseded by a manual start or a newer exit.
                _ => None,
            },
            // Removed while the delay was pending.
            None => None,
        };
        let Some(marker) = armed else {
            debug!(process = %name, generation, "delayed respawn cancelled");
            return;
        };
        info!(process = %name, "respawning process");
        if let Err(error) = self.start_process(name, marker).await {
            warn!(process = %name, %error, "respawn failed");
            self.broadcast(Notification::OperationFailed {
                opcode: op::START_PROCESS,
                name: name.to_string(),
            });
        }
    }

    async fn handle_exit(&mut self, event: ExitEvent) {
        let (privileged, respawn_enabled, remove_on_down) = match self.records.get(&event.name) {
            Some(entry) => (
                entry.spec.privileged,
                entry.spec.respawn,
                entry.remove_on_down,
            ),
            None => return,
        };
        let others_running = self.others_running(&event.name);

        let uptime_millis = i64::try_from(event.uptime.as_millis()).unwrap_or(i64::MAX);
        self.broadcast(Notification::ProcessStopped {
            name: event.name.clone(),
            uptime_millis,
        });

        if self.shutting_down || remove_on_down {
            self.remove_record(&event.name).await;
            self.finish_if_drained();
            return;
        }

        if privileged && event.exit_code == Some(CONTROLLER_ABORT_EXIT) {
            if others_running {
                warn!(
                    process = %event.name,
                    "controller aborted with live dependents, respawning"
                );
                // Abort recovery is the one relaunch that carries the
                // restart marker.
                self.schedule_respawn(
                    &event.name,
                    event.generation,
                    RespawnDirective::unlimited_slow(),
                    true,
                );
            } else {
                info!(process = %event.name, "controller aborted, shutting down");
                self.remove_record(&event.name).await;
                self.begin_shutdown(0).await;
            }
            return;
        }

        if privileged && event.exit_code == Some(RESTART_REQUESTED_EXIT) {
            info!(process = %event.name, "controller requested full restart");
            self.remove_record(&event.name).await;
            self.begin_shutdown(RESTART_REQUESTED_EXIT).await;
            return;
        }

        if !event.stop_requested && respawn_enabled {
            let directive = RespawnDirective {
                unlimited: privileged && others_running,
                slow: false,
            };
            self.schedule_respawn(&event.name, event.generation, directive, false);
        }
    }

    fn schedule_respawn(
        &mut self,
        name: &str,
        generation: u64,
        directive: RespawnDirective,
        marker: bool,
    ) {
        let Some(entry) = self.records.get_mut(name) else {
            return;
        };
        if !entry.tracker.permits(directive) {
            warn!(
                process = %name,
                attempts = entry.tracker.count(),
                "respawn attempts exhausted, record stays down"
            );
            return;
        }
        let delay = entry.tracker.record_attempt(directive);
        entry.pending_respawn = Some(PendingRespawn { generation, marker });
        info!(
            process = %name,
            attempt = entry.tracker.count(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "respawn scheduled"
        );

        let sleep = self.clock.sleep(delay);
        let self_tx = self.self_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            sleep.await;
            let _ = self_tx
                .send(SupervisorCommand::RespawnFire { name, generation })
                .await;
        });
    }

    async fn remove_record(&mut self, name: &str) {
        if let Some(entry) = self.records.remove(name) {
            entry.handle.close().await;
            info!(process = %name, "process removed");
            self.broadcast(Notification::ProcessRemoved {
                name: name.to_string(),
            });
        }
    }

    fn others_running(&self, except: &str) -> bool {
        self.records
            .iter()
            .any(|(name, entry)| name != except && entry.handle.status().is_running())
    }

    fn finish_if_drained(&mut self) {
        if self.shutting_down && self.records.is_empty() {
            info!(exit_code = self.pending_exit_code, "fleet drained, exiting");
            let _ = self.exit_tx.send(Some(self.pending_exit_code));
        }
    }

    /// Fan a notification out to every authenticated connection. Failed
    /// or lagging connections are dropped from the set, not retried.
    fn broadcast(&mut self, notification: Notification) {
        self.subscribers
            .retain(|subscriber| subscriber.try_send(notification.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use procfleet_core::{BackoffConfig, RESTART_MARKER};
    use tokio::time::timeout;

    use super::*;
    use crate::clock::TokioClock;
    use crate::relay::spawn_writer;

    fn test_config() -> SupervisorConfig {
        SupervisorConfig::new()
            .with_grace_period(Duration::from_millis(200))
            .with_respawn_policy(
                RespawnPolicy::new()
                    .with_max_respawns(3)
                    .with_backoff(BackoffConfig::Fixed {
                        delay: Duration::from_millis(50),
                    })
                    .with_slow_interval(Duration::from_millis(100)),
            )
    }

    fn spawn_supervisor() -> SupervisorHandle {
        let (log_tx, _writer) = spawn_writer(256);
        SupervisorHandle::spawn(test_config(), Arc::new(TokioClock), log_tx)
    }

    fn long_runner(name: &str) -> ProcessSpec {
        ProcessSpec::new(name, "/bin/sh")
            .arg("-c")
            .arg("while read line; do :; done")
    }

    async fn recv_notification(
        rx: &mut mpsc::Receiver<Notification>,
    ) -> Notification {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification channel closed")
    }

    async fn wait_until_running(supervisor: &SupervisorHandle, name: &str, running: bool) {
        timeout(Duration::from_secs(10), async {
            loop {
                let inventory = supervisor.inventory().await.expect("inventory");
                let matches = inventory
                    .iter()
                    .any(|e| e.name == name && e.running == running);
                if matches {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timed out waiting for state");
    }

    async fn wait_for_lines(path: &std::path::Path, count: usize) -> Vec<String> {
        timeout(Duration::from_secs(10), async {
            loop {
                let lines: Vec<String> = std::fs::read_to_string(path)
                    .unwrap_or_default()
                    .lines()
                    .map(str::to_string)
                    .collect();
                if lines.len() >= count {
                    return lines;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timed out waiting for file lines")
    }

    #[tokio::test]
    async fn add_start_stop_remove_lifecycle() {
        let supervisor = spawn_supervisor();
        supervisor
            .add_process(long_runner("worker"))
            .await
            .expect("add");
        supervisor.start_process("worker").await.expect("start");
        wait_until_running(&supervisor, "worker", true).await;

        supervisor.stop_process("worker").await.expect("stop");
        wait_until_running(&supervisor, "worker", false).await;

        supervisor.remove_process("worker").await.expect("remove");
        assert!(supervisor.inventory().await.expect("inventory").is_empty());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let supervisor = spawn_supervisor();
        supervisor
            .add_process(long_runner("worker"))
            .await
            .expect("add");
        assert!(matches!(
            supervisor.add_process(long_runner("worker")).await,
            Err(SupervisorError::DuplicateName(name)) if name == "worker"
        ));
    }

    #[tokio::test]
    async fn authentication_resets_respawn_counter_and_joins_fanout() {
        let supervisor = spawn_supervisor();
        supervisor
            .add_process(long_runner("worker"))
            .await
            .expect("add");

        let inventory = supervisor.inventory().await.expect("inventory");
        let token = inventory[0].token.clone();

        let (notif_tx, mut notif_rx) = mpsc::channel(64);
        let grant = supervisor
            .authenticate(token, notif_tx)
            .await
            .expect("supervisor alive")
            .expect("token should match");
        assert_eq!(grant.name, "worker");
        assert!(!grant.privileged);

        // A subsequent lifecycle event reaches the subscriber.
        supervisor.start_process("worker").await.expect("start");
        assert!(matches!(
            recv_notification(&mut notif_rx).await,
            Notification::ProcessStarted { name } if name == "worker"
        ));
    }

    #[tokio::test]
    async fn bad_token_is_refused() {
        let supervisor = spawn_supervisor();
        supervisor
            .add_process(long_runner("worker"))
            .await
            .expect("add");

        let mut token = supervisor.inventory().await.expect("inventory")[0]
            .token
            .clone();
        token[0] ^= 0x01;

        let (notif_tx, _notif_rx) = mpsc::channel(64);
        assert!(supervisor
            .authenticate(token, notif_tx)
            .await
            .expect("supervisor alive")
            .is_none());
    }

    #[tokio::test]
    async fn crash_triggers_respawn_with_fresh_process() {
        let supervisor = spawn_supervisor();
        // Exits immediately with a crash code; respawn enabled.
        let spec = ProcessSpec::new("flappy", "/bin/sh")
            .arg("-c")
            .arg("exit 3")
            .with_respawn(true);
        supervisor.add_process(spec).await.expect("add");

        let token = supervisor.inventory().await.expect("inventory")[0]
            .token
            .clone();
        let (notif_tx, mut notif_rx) = mpsc::channel(64);
        supervisor
            .authenticate(token, notif_tx)
            .await
            .expect("supervisor alive")
            .expect("token");

        supervisor.start_process("flappy").await.expect("start");

        // started, stopped, then the respawn starts it again.
        let mut starts = 0;
        while starts < 2 {
            if matches!(
                recv_notification(&mut notif_rx).await,
                Notification::ProcessStarted { .. }
            ) {
                starts += 1;
            }
        }
    }

    #[tokio::test]
    async fn respawn_gives_up_after_the_cap() {
        let supervisor = spawn_supervisor();
        let spec = ProcessSpec::new("flappy", "/bin/sh")
            .arg("-c")
            .arg("exit 3")
            .with_respawn(true);
        supervisor.add_process(spec).await.expect("add");
        supervisor.start_process("flappy").await.expect("start");

        // Cap is 3 attempts at 50ms apart; well within the timeout the
        // record must settle down and stay there.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let inventory = supervisor.inventory().await.expect("inventory");
        assert_eq!(inventory.len(), 1);
        assert!(!inventory[0].running);
    }

    #[tokio::test]
    async fn stop_immediately_after_start_is_not_lost() {
        let supervisor = spawn_supervisor();
        supervisor
            .add_process(long_runner("worker"))
            .await
            .expect("add");
        // No settling delay between the two; the start reply must already
        // reflect a running record or the stop would be dropped.
        supervisor.start_process("worker").await.expect("start");
        supervisor.stop_process("worker").await.expect("stop");
        wait_until_running(&supervisor, "worker", false).await;
    }

    #[tokio::test]
    async fn crash_respawn_keeps_the_original_argv() {
        let supervisor = spawn_supervisor();
        let dir = tempfile::tempdir().expect("tempdir");
        let args_file = dir.path().join("args.txt");
        let spec = ProcessSpec::new("flappy", "/bin/sh")
            .arg("-c")
            .arg(format!("echo arg=$1 >> {}; exit 3", args_file.display()))
            .arg("sh0")
            .with_respawn(true);
        supervisor.add_process(spec).await.expect("add");
        supervisor.start_process("flappy").await.expect("start");

        let lines = wait_for_lines(&args_file, 2).await;
        // A plain crash relaunch runs with the original command line.
        assert!(lines.iter().all(|line| line == "arg="), "{lines:?}");
    }

    #[tokio::test]
    async fn stop_requested_exit_does_not_respawn() {
        let supervisor = spawn_supervisor();
        supervisor
            .add_process(long_runner("worker").with_respawn(true))
            .await
            .expect("add");
        supervisor.start_process("worker").await.expect("start");
        wait_until_running(&supervisor, "worker", true).await;

        supervisor.stop_process("worker").await.expect("stop");
        wait_until_running(&supervisor, "worker", false).await;

        // Give a would-be respawn time to fire; it must not.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let inventory = supervisor.inventory().await.expect("inventory");
        assert!(!inventory[0].running);
    }

    #[tokio::test]
    async fn removal_cancels_a_pending_respawn() {
        let supervisor = spawn_supervisor();
        let spec = ProcessSpec::new("flappy", "/bin/sh")
            .arg("-c")
            .arg("exit 3")
            .with_respawn(true);
        supervisor.add_process(spec).await.expect("add");
        supervisor.start_process("flappy").await.expect("start");
        wait_until_running(&supervisor, "flappy", false).await;

        // Remove while the 50ms respawn delay is pending.
        supervisor.remove_process("flappy").await.expect("remove");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(supervisor.inventory().await.expect("inventory").is_empty());
    }

    #[tokio::test]
    async fn controller_abort_without_dependents_shuts_down() {
        let supervisor = spawn_supervisor();
        let spec = ProcessSpec::new("controller", "/bin/sh")
            .arg("-c")
            .arg(format!("exit {CONTROLLER_ABORT_EXIT}"))
            .with_respawn(true)
            .privileged();
        supervisor.add_process(spec).await.expect("add");
        supervisor.start_process("controller").await.expect("start");

        let code = timeout(Duration::from_secs(10), supervisor.wait_for_exit())
            .await
            .expect("timed out waiting for exit");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn restart_request_exits_with_the_same_code() {
        let supervisor = spawn_supervisor();
        let spec = ProcessSpec::new("controller", "/bin/sh")
            .arg("-c")
            .arg(format!("exit {RESTART_REQUESTED_EXIT}"))
            .privileged();
        supervisor.add_process(spec).await.expect("add");
        supervisor.start_process("controller").await.expect("start");

        let code = timeout(Duration::from_secs(10), supervisor.wait_for_exit())
            .await
            .expect("timed out waiting for exit");
        assert_eq!(code, RESTART_REQUESTED_EXIT);
    }

    #[tokio::test]
    async fn controller_abort_with_dependents_respawns_slowly() {
        let supervisor = spawn_supervisor();
        supervisor
            .add_process(long_runner("dependent"))
            .await
            .expect("add");
        supervisor.start_process("dependent").await.expect("start");
        wait_until_running(&supervisor, "dependent", true).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let args_file = dir.path().join("args.txt");
        let spec = ProcessSpec::new("controller", "/bin/sh")
            .arg("-c")
            .arg(format!(
                "echo arg=$1 >> {}; exit {CONTROLLER_ABORT_EXIT}",
                args_file.display()
            ))
            .arg("sh0")
            .privileged();
        supervisor.add_process(spec).await.expect("add");

        let token = supervisor
            .inventory()
            .await
            .expect("inventory")
            .into_iter()
            .find(|e| e.name == "controller")
            .expect("controller entry")
            .token;
        let (notif_tx, mut notif_rx) = mpsc::channel(64);
        supervisor
            .authenticate(token, notif_tx)
            .await
            .expect("supervisor alive")
            .expect("token");

        supervisor.start_process("controller").await.expect("start");

        // First spawn, abort exit, then the slow-interval respawn.
        let mut controller_starts = 0;
        while controller_starts < 2 {
            if matches!(
                recv_notification(&mut notif_rx).await,
                Notification::ProcessStarted { name } if name == "controller"
            ) {
                controller_starts += 1;
            }
        }

        // The abort relaunch carries the restart marker.
        let lines = wait_for_lines(&args_file, 2).await;
        assert_eq!(lines[0], "arg=");
        assert_eq!(lines[1], format!("arg={RESTART_MARKER}"));
    }

    #[tokio::test]
    async fn shutdown_stops_everything_and_resolves_exit() {
        let supervisor = spawn_supervisor();
        supervisor
            .add_process(long_runner("one"))
            .await
            .expect("add");
        supervisor
            .add_process(long_runner("two"))
            .await
            .expect("add");
        supervisor.start_process("one").await.expect("start");
        supervisor.start_process("two").await.expect("start");
        wait_until_running(&supervisor, "one", true).await;
        wait_until_running(&supervisor, "two", true).await;

        supervisor.shutdown(0).await;
        let code = timeout(Duration::from_secs(10), supervisor.wait_for_exit())
            .await
            .expect("timed out waiting for exit");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn start_on_unknown_record_fails() {
        let supervisor = spawn_supervisor();
        assert!(matches!(
            supervisor.start_process("ghost").await,
            Err(SupervisorError::UnknownProcess(name)) if name == "ghost"
        ));
    }
}
