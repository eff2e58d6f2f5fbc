//! Per-connection session: handshake, privilege gate, request dispatch.
//!
//! A connection's first frame must be `AUTH`. Any handshake failure, bad
//! version, malformed frame, or unknown token, closes the connection with
//! no reply at all, so a scanner probing the control port learns nothing.
//!
//! After the handshake the session runs a select loop over inbound frames
//! and the record's outbound notification queue. The privilege gate is
//! checked before anything else: a session authenticated as an
//! unprivileged record has every non-`AUTH` request traced and ignored.

use futures::{SinkExt, StreamExt};
use procfleet_core::protocol::Notification;
use procfleet_core::{ProcessSpec, Request, PROTOCOL_VERSION};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::error::ProtocolError;
use super::framing::FrameCodec;
use crate::supervisor::{AuthGrant, SupervisorError, SupervisorHandle};

const NOTIFY_BUFFER: usize = 64;

type Transport = Framed<TcpStream, FrameCodec>;

/// Drive one control connection to completion.
///
/// Returns `Ok(())` for clean closes and silent handshake rejections; an
/// `Err` means the peer violated the protocol mid-session or the
/// transport failed.
///
/// # Errors
///
/// Propagates [`ProtocolError`] from framing, decoding, and I/O.
pub async fn serve_connection(
    stream: TcpStream,
    supervisor: SupervisorHandle,
) -> Result<(), ProtocolError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    let first = match framed.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(error)) => {
            debug!(%error, "connection failed before handshake");
            return Ok(());
        }
        None => return Ok(()),
    };
    let Ok(Request::Auth { version, token }) = Request::decode(first) else {
        debug!("first frame was not a well-formed AUTH, closing");
        return Ok(());
    };
    if version != PROTOCOL_VERSION {
        debug!(version, "unsupported protocol version, closing");
        return Ok(());
    }

    let (notif_tx, mut notif_rx) = mpsc::channel(NOTIFY_BUFFER);
    let Some(grant) = supervisor.authenticate(token, notif_tx).await.ok().flatten() else {
        // Token miss: no nack, no hint of which names exist.
        debug!("authentication failed, closing without reply");
        return Ok(());
    };
    framed.codec_mut().upgrade_to_full_frame_size();
    info!(process = %grant.name, privileged = grant.privileged, "session established");

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                None => {
                    debug!(process = %grant.name, "peer closed session");
                    return Ok(());
                }
                Some(Err(error)) => {
                    warn!(process = %grant.name, %error, "transport error, closing session");
                    return Err(error);
                }
                Some(Ok(frame)) => {
                    let request = match Request::decode(frame) {
                        Ok(request) => request,
                        Err(error) => {
                            warn!(process = %grant.name, %error, "malformed request, closing session");
                            return Err(error.into());
                        }
                    };
                    handle_request(&mut framed, &supervisor, &grant, request).await?;
                }
            },
            notification = notif_rx.recv() => match notification {
                Some(notification) => framed.send(notification.encode()).await?,
                // The supervisor dropped this connection from its fan-out.
                None => return Ok(()),
            },
        }
    }
}

async fn handle_request(
    framed: &mut Transport,
    supervisor: &SupervisorHandle,
    grant: &AuthGrant,
    request: Request,
) -> Result<(), ProtocolError> {
    if matches!(request, Request::Auth { .. }) {
        debug!(process = %grant.name, "repeated AUTH ignored");
        return Ok(());
    }

    // Privilege is checked before looking at the request at all.
    if !grant.privileged {
        debug!(
            process = %grant.name,
            opcode = request.opcode(),
            "unprivileged request ignored"
        );
        return Ok(());
    }

    let opcode = request.opcode();
    let failed_name = request.process_name().unwrap_or_default().to_string();
    match dispatch(framed, supervisor, request).await {
        Ok(()) => Ok(()),
        Err(SupervisorError::Terminated) => {
            warn!("supervisor gone, closing session");
            Err(ProtocolError::ConnectionClosed)
        }
        Err(error) => {
            warn!(opcode, process = %failed_name, %error, "operation failed");
            // Best effort; a send failure here is only logged.
            let failure = Notification::OperationFailed {
                opcode,
                name: failed_name,
            };
            if let Err(send_error) = framed.send(failure.encode()).await {
                debug!(%send_error, "failed to deliver operation-failed notification");
            }
            Ok(())
        }
    }
}

async fn dispatch(
    framed: &mut Transport,
    supervisor: &SupervisorHandle,
    request: Request,
) -> Result<(), SupervisorError> {
    match request {
        Request::Auth { .. } => Ok(()),
        Request::AddProcess {
            name,
            pid_hint,
            command,
            env,
            working_dir,
        } => {
            if pid_hint >= 0 {
                debug!(process = %name, pid_hint, "pid hint noted");
            }
            let Some(program) = command.first().cloned() else {
                return Err(SupervisorError::SpawnFailed {
                    name,
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "empty command line",
                    ),
                });
            };
            let mut spec = ProcessSpec::new(name, program);
            spec.command = command;
            for (key, value) in env {
                spec = spec.env(key, value);
            }
            if !working_dir.is_empty() {
                spec = spec.working_dir(working_dir);
            }
            supervisor.add_process(spec).await
        }
        Request::StartProcess { name } => supervisor.start_process(name).await,
        Request::StopProcess { name } => supervisor.stop_process(name).await,
        Request::RemoveProcess { name } => supervisor.remove_process(name).await,
        Request::DestroyProcess { name } => supervisor.destroy_process(name).await,
        Request::KillProcess { name } => supervisor.kill_process(name).await,
        Request::SendStdin { name, payload } => supervisor.send_stdin(name, payload).await,
        Request::RequestProcessInventory => {
            let entries = supervisor.inventory().await?;
            let reply = Notification::ProcessInventory { entries };
            if let Err(error) = framed.send(reply.encode()).await {
                debug!(%error, "failed to deliver inventory");
            }
            Ok(())
        }
        Request::ReconnectProcess { ref name, .. } => {
            // The whole message is forwarded to the target child over its
            // framed stdin channel; the child decodes it with the same
            // protocol catalogue.
            let target = name.clone();
            let payload = request.encode().to_vec();
            supervisor.send_stdin(target.clone(), payload).await?;
            let reply = Notification::ProcessReconnected { name: target };
            if let Err(error) = framed.send(reply.encode()).await {
                debug!(%error, "failed to deliver reconnect acknowledgement");
            }
            Ok(())
        }
        Request::Shutdown { exit_code } => {
            supervisor.shutdown(exit_code).await;
            Ok(())
        }
    }
}
