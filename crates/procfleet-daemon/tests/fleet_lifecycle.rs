//! End-to-end fleet control through the socket, plus crash respawn.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use procfleet_core::protocol::Notification;
use procfleet_core::stdin_frame::FrameDecoder;
use procfleet_core::{
    BackoffConfig, ProcessSpec, Request, RespawnPolicy, PROTOCOL_VERSION, TOKEN_LEN,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use procfleet_daemon::clock::TokioClock;
use procfleet_daemon::protocol::{ControlServer, ControlServerConfig, FrameCodec};
use procfleet_daemon::relay::spawn_writer;
use procfleet_daemon::supervisor::{SupervisorConfig, SupervisorHandle};

struct Harness {
    supervisor: SupervisorHandle,
    addr: std::net::SocketAddr,
}

async fn harness() -> Harness {
    let (log_tx, _writer) = spawn_writer(256);
    let config = SupervisorConfig::new()
        .with_grace_period(Duration::from_millis(200))
        .with_respawn_policy(
            RespawnPolicy::new()
                .with_max_respawns(5)
                .with_backoff(BackoffConfig::Fixed {
                    delay: Duration::from_millis(50),
                }),
        );
    let supervisor = SupervisorHandle::spawn(config, Arc::new(TokioClock), log_tx);
    let server = ControlServer::bind(&ControlServerConfig::new())
        .await
        .expect("bind");
    let addr = server.local_addr().expect("local addr");
    {
        let supervisor = supervisor.clone();
        tokio::spawn(server.serve(supervisor));
    }
    Harness { supervisor, addr }
}

fn sleeper(name: &str) -> ProcessSpec {
    ProcessSpec::new(name, "/bin/sh")
        .arg("-c")
        .arg("while read line; do :; done")
}

async fn token_of(supervisor: &SupervisorHandle, name: &str) -> Vec<u8> {
    supervisor
        .inventory()
        .await
        .expect("inventory")
        .into_iter()
        .find(|e| e.name == name)
        .expect("record present")
        .token
}

type Client = Framed<TcpStream, FrameCodec>;

async fn privileged_client(h: &Harness, name: &str) -> Client {
    let token = token_of(&h.supervisor, name).await;
    let stream = TcpStream::connect(h.addr).await.expect("connect");
    let mut client = Framed::new(stream, FrameCodec::full());
    client
        .send(
            Request::Auth {
                version: PROTOCOL_VERSION,
                token,
            }
            .encode(),
        )
        .await
        .expect("auth send");
    client
}

async fn send(client: &mut Client, request: &Request) {
    client.send(request.encode()).await.expect("send");
}

async fn recv(client: &mut Client) -> Notification {
    let frame = timeout(Duration::from_secs(10), client.next())
        .await
        .expect("timed out waiting for notification")
        .expect("connection closed")
        .expect("frame error");
    Notification::decode(frame).expect("notification decode")
}

async fn wait_running(supervisor: &SupervisorHandle, name: &str, running: bool) {
    timeout(Duration::from_secs(10), async {
        loop {
            let found = supervisor
                .inventory()
                .await
                .expect("inventory")
                .into_iter()
                .any(|e| e.name == name && e.running == running);
            if found {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for state");
}

async fn wait_for_file(path: &std::path::Path) -> String {
    timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(contents) = std::fs::read_to_string(path) {
                if !contents.trim().is_empty() {
                    return contents;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for file")
}

#[tokio::test]
async fn privileged_session_drives_a_worker_lifecycle() {
    let h = harness().await;
    h.supervisor
        .add_process(sleeper("controller").privileged())
        .await
        .expect("add controller");
    let mut client = privileged_client(&h, "controller").await;

    send(
        &mut client,
        &Request::AddProcess {
            name: "w2".to_string(),
            pid_hint: -1,
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "while read line; do :; done".to_string(),
            ],
            env: vec![],
            working_dir: String::new(),
        },
    )
    .await;
    assert!(matches!(
        recv(&mut client).await,
        Notification::ProcessAdded { name } if name == "w2"
    ));

    send(
        &mut client,
        &Request::StartProcess {
            name: "w2".to_string(),
        },
    )
    .await;
    assert!(matches!(
        recv(&mut client).await,
        Notification::ProcessStarted { name } if name == "w2"
    ));
    wait_running(&h.supervisor, "w2", true).await;

    // An unprivileged session holding w2's token cannot stop it.
    let w2_token = token_of(&h.supervisor, "w2").await;
    let stream = TcpStream::connect(h.addr).await.expect("connect");
    let mut w2_client = Framed::new(stream, FrameCodec::full());
    w2_client
        .send(
            Request::Auth {
                version: PROTOCOL_VERSION,
                token: w2_token,
            }
            .encode(),
        )
        .await
        .expect("auth send");
    send(
        &mut w2_client,
        &Request::StopProcess {
            name: "w2".to_string(),
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    wait_running(&h.supervisor, "w2", true).await;

    // The privileged session can.
    send(
        &mut client,
        &Request::StopProcess {
            name: "w2".to_string(),
        },
    )
    .await;
    loop {
        if let Notification::ProcessStopped { name, uptime_millis } = recv(&mut client).await {
            assert_eq!(name, "w2");
            assert!(uptime_millis >= 0);
            break;
        }
    }
    wait_running(&h.supervisor, "w2", false).await;

    send(
        &mut client,
        &Request::RemoveProcess {
            name: "w2".to_string(),
        },
    )
    .await;
    loop {
        if let Notification::ProcessRemoved { name } = recv(&mut client).await {
            assert_eq!(name, "w2");
            break;
        }
    }
}

#[tokio::test]
async fn externally_killed_worker_is_respawned() {
    let h = harness().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let pidfile = dir.path().join("worker.pid");

    let spec = ProcessSpec::new("worker", "/bin/sh")
        .arg("-c")
        .arg(format!(
            "echo $$ > {}; while read line; do :; done",
            pidfile.display()
        ))
        .with_respawn(true);
    h.supervisor.add_process(spec).await.expect("add");
    h.supervisor.start_process("worker").await.expect("start");

    let first_pid: i32 = wait_for_file(&pidfile).await.trim().parse().expect("pid");
    kill(Pid::from_raw(first_pid), Signal::SIGKILL).expect("kill");

    // The reaper notices the unrequested exit and respawns; the fresh
    // child writes a different pid.
    timeout(Duration::from_secs(10), async {
        loop {
            let contents = std::fs::read_to_string(&pidfile).unwrap_or_default();
            if let Ok(pid) = contents.trim().parse::<i32>() {
                if pid != first_pid {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for respawn");
    wait_running(&h.supervisor, "worker", true).await;
}

#[tokio::test]
async fn send_stdin_payload_is_framed_onto_child_stdin() {
    let h = harness().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let capture = dir.path().join("stdin.bin");

    h.supervisor
        .add_process(sleeper("controller").privileged())
        .await
        .expect("add controller");
    let spec = ProcessSpec::new("sink", "/bin/sh")
        .arg("-c")
        .arg(format!("cat > {}", capture.display()));
    h.supervisor.add_process(spec).await.expect("add sink");
    h.supervisor.start_process("sink").await.expect("start");

    // Binary payload that would corrupt an unframed line protocol.
    let payload = vec![0x00, 0x9f, 0x92, 0x96, b'\n', 0x07];
    let mut client = privileged_client(&h, "controller").await;
    send(
        &mut client,
        &Request::SendStdin {
            name: "sink".to_string(),
            payload: payload.clone(),
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Stop so `cat` sees EOF and flushes the capture file.
    h.supervisor.stop_process("sink").await.expect("stop");
    wait_running(&h.supervisor, "sink", false).await;

    let raw = std::fs::read(&capture).expect("capture file");
    let mut decoder = FrameDecoder::new();
    let frames = decoder.push(&raw).expect("framed stdin decodes");
    assert_eq!(frames.len(), 2, "token frame plus payload frame");
    assert_eq!(frames[0].len(), TOKEN_LEN);
    assert_eq!(frames[1], payload);
}

#[tokio::test]
async fn reconnect_message_round_trips_through_child_stdin() {
    let h = harness().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let capture = dir.path().join("stdin.bin");

    h.supervisor
        .add_process(sleeper("controller").privileged())
        .await
        .expect("add controller");
    // Capture everything the supervisor writes to the child's stdin.
    let spec = ProcessSpec::new("target", "/bin/sh")
        .arg("-c")
        .arg(format!("cat > {}", capture.display()));
    h.supervisor.add_process(spec).await.expect("add target");
    h.supervisor.start_process("target").await.expect("start");

    let reconnect = Request::ReconnectProcess {
        name: "target".to_string(),
        scheme: "remote".to_string(),
        host: "127.0.0.1".to_string(),
        port: 9990,
        management_endpoint: true,
        auth_token: "mgmt-token".to_string(),
    };
    let mut client = privileged_client(&h, "controller").await;
    send(&mut client, &reconnect).await;
    assert!(matches!(
        recv(&mut client).await,
        Notification::ProcessReconnected { name } if name == "target"
    ));

    // Stop so `cat` sees EOF and flushes the capture file.
    h.supervisor.stop_process("target").await.expect("stop");
    wait_running(&h.supervisor, "target", false).await;

    let raw = std::fs::read(&capture).expect("capture file");
    let mut decoder = FrameDecoder::new();
    let frames = decoder.push(&raw).expect("framed stdin decodes");
    assert_eq!(frames.len(), 2, "token frame plus reconnect frame");
    assert_eq!(frames[0].len(), TOKEN_LEN);
    let decoded = Request::decode(frames[1].clone().into()).expect("request decode");
    assert_eq!(decoded, reconnect);
}

#[tokio::test]
async fn shutdown_over_the_socket_resolves_the_exit_code() {
    let h = harness().await;
    h.supervisor
        .add_process(sleeper("controller").privileged())
        .await
        .expect("add controller");
    h.supervisor
        .start_process("controller")
        .await
        .expect("start");
    wait_running(&h.supervisor, "controller", true).await;

    let mut client = privileged_client(&h, "controller").await;
    send(&mut client, &Request::Shutdown { exit_code: 0 }).await;

    let code = timeout(Duration::from_secs(10), h.supervisor.wait_for_exit())
        .await
        .expect("timed out waiting for exit");
    assert_eq!(code, 0);
}
