//! procfleetd: bootstrap entry point.
//!
//! Binds the control socket, starts the supervisor, registers the primary
//! (privileged) process with the socket's address injected into its
//! command line, then waits for the fleet to drain or a termination
//! signal.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use procfleet_core::ProcessSpec;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use procfleet_daemon::clock::TokioClock;
use procfleet_daemon::protocol::{ControlServer, ControlServerConfig, IpPreference};
use procfleet_daemon::relay::spawn_writer;
use procfleet_daemon::supervisor::{SupervisorConfig, SupervisorHandle};

/// Record name of the privileged primary process.
const PRIMARY_NAME: &str = "controller";

const LOG_ENV_VAR: &str = "PROCFLEET_LOG";

const RELAY_BUFFER: usize = 1024;

/// Extra slack past the grace window before the daemon gives up waiting
/// for the fleet to drain.
const DRAIN_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "procfleetd", version, about = "Bootstrap process supervisor")]
struct Args {
    /// Bind address for the control socket; loopback when unset.
    #[arg(long)]
    bind_address: Option<IpAddr>,

    /// Control socket port; 0 picks an ephemeral port.
    #[arg(long, default_value_t = 0)]
    bind_port: u16,

    /// Prefer the IPv6 loopback when no bind address is given.
    #[arg(long)]
    ipv6: bool,

    /// Log filter, e.g. `info` or `procfleet=debug`. Overrides PROCFLEET_LOG.
    #[arg(long)]
    log_level: Option<String>,

    /// Append daemon logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Grace window in seconds before forced termination escalates.
    #[arg(long, default_value_t = 5)]
    grace_seconds: u64,

    /// Pass a security-manager flag through to the primary process.
    #[arg(long)]
    secmgr: bool,

    /// Command line of the primary process.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid log filter")?,
        None => EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info")),
    };
    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn primary_spec(args: &Args, control_addr: std::net::SocketAddr) -> ProcessSpec {
    let mut command = args.command.clone();
    command.push("--supervisor-address".to_string());
    command.push(control_addr.ip().to_string());
    command.push("--supervisor-port".to_string());
    command.push(control_addr.port().to_string());
    if args.secmgr {
        command.push("-secmgr".to_string());
    }

    let mut spec = ProcessSpec::new(PRIMARY_NAME, command.remove(0))
        .with_respawn(true)
        .privileged();
    spec.command.extend(command);
    spec
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(error) = init_tracing(&args) {
        eprintln!("procfleetd: {error:#}");
        std::process::exit(1);
    }

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error!("{error:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let grace = Duration::from_secs(args.grace_seconds);
    let (log_tx, _relay_writer) = spawn_writer(RELAY_BUFFER);
    let supervisor = SupervisorHandle::spawn(
        SupervisorConfig::new().with_grace_period(grace),
        Arc::new(TokioClock),
        log_tx,
    );

    let mut server_config = ControlServerConfig::new()
        .with_port(args.bind_port)
        .with_preference(if args.ipv6 {
            IpPreference::V6
        } else {
            IpPreference::V4
        });
    if let Some(address) = args.bind_address {
        server_config = server_config.with_bind_address(address);
    }
    let server = ControlServer::bind(&server_config)
        .await
        .context("failed to bind control socket")?;
    let control_addr = server.local_addr().context("control socket address")?;

    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if let Err(error) = server.serve(supervisor).await {
                error!(%error, "control server failed");
            }
        });
    }

    let spec = primary_spec(&args, control_addr);
    info!(command = ?spec.command, "launching primary process");
    supervisor
        .add_process(spec)
        .await
        .context("failed to register primary process")?;
    supervisor
        .start_process(PRIMARY_NAME)
        .await
        .context("failed to start primary process")?;

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;

    let code = tokio::select! {
        code = supervisor.wait_for_exit() => code,
        _ = sigterm.recv() => drain(&supervisor, grace, "SIGTERM").await,
        _ = sigint.recv() => drain(&supervisor, grace, "SIGINT").await,
    };
    info!(exit_code = code, "supervisor exiting");
    Ok(code)
}

/// Ask the fleet to stop and wait for it, bounded by the grace window
/// plus slack.
async fn drain(supervisor: &SupervisorHandle, grace: Duration, reason: &str) -> i32 {
    info!(reason, "shutdown signal received");
    supervisor.shutdown(0).await;
    match timeout(grace + DRAIN_SLACK, supervisor.wait_for_exit()).await {
        Ok(code) => code,
        Err(_) => {
            warn!("fleet did not drain in time, exiting anyway");
            1
        }
    }
}
