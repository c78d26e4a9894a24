//! Host-side bridge for enclave network I/O.
//!
//! The bridge waits for an enclave to initiate the handshake on the vsock
//! init port, then exposes the enclave's servers as TCP listeners, dials TCP
//! targets on the enclave's behalf, relays the enclave's log stream to
//! stdout, and watches the enclave's heartbeat. A shutdown signal cancels
//! the root token; a cancellation-only exit is status 0.

mod bridge;
mod error;
mod handshake;
mod logging;
mod monitor;
mod tunnel;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use error::BridgeError;
use protocol::settings;
use protocol::transport;
use tunnel::StdoutTunnel;

const DEFAULT_MON_PORT: u16 = 8888;
const MON_PORT_ENV_VAR: &str = "MON_PORT";
const ENV_DENYLIST_ENV_VAR: &str = "ENCLAVE_BRIDGE_ENV_DENYLIST";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logging = logging::init();

    let token = CancellationToken::new();
    spawn_signal_watcher(token.clone());

    let init_port = settings::init_port_from_env().context("invalid init port")?;
    let stdout_port = settings::stdout_port_from_env().context("invalid stdout port")?;
    let mon_port = mon_port_from_env()?;
    let denylist = std::env::var(ENV_DENYLIST_ENV_VAR).ok();

    let mut tasks: JoinSet<Result<(), BridgeError>> = JoinSet::new();

    let stdout_tunnel = StdoutTunnel::new(stdout_port);
    let stdout_token = token.clone();
    tasks.spawn(async move { stdout_tunnel.run(stdout_token).await.map_err(Into::into) });

    let mon_token = token.clone();
    tasks.spawn(async move { monitor::serve(mon_port, mon_token).await.map_err(Into::into) });

    // Bound before any enclave contact so a booting enclave can always
    // reach the init port.
    let listener = transport::listen(transport::HOST_CID, init_port)
        .context("failed to listen on the init port")?;
    tasks.spawn(bridge::run(listener, denylist, logging, token.clone()));

    let mut exit: Result<(), BridgeError> = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|err| Err(BridgeError::Task(err)));
        if let Err(err) = result {
            if exit.is_ok() {
                exit = Err(err);
            }
            token.cancel();
        }
    }

    if let Err(err) = exit {
        tracing::error!("Bridge failed: {}", err);
        std::process::exit(1);
    }
    Ok(())
}

fn spawn_signal_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        token.cancel();
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn mon_port_from_env() -> anyhow::Result<u16> {
    match std::env::var(MON_PORT_ENV_VAR) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid {MON_PORT_ENV_VAR}: {value}")),
        Err(_) => Ok(DEFAULT_MON_PORT),
    }
}
