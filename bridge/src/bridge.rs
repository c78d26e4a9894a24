//! Bridge orchestrator.
//!
//! Runs the handshake on the init-port listener, spawns one task per tunnel
//! plus the watchdog server, sends the ready ACK, and supervises the lot:
//! the first non-cancellation error cancels the root token and becomes the
//! bridge's exit reason.

use protocol::transport::Accept;
use protocol::watchdog::Watchdog;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::handshake::{self, HandshakeError};
use crate::logging::LevelHandle;
use crate::tunnel::{ClientTunnel, ServerTunnel};

/// Accepts one handshake on `listener` and runs the resulting bridge until
/// shutdown. The listener is reused as the watchdog listener once the
/// handshake connection closes.
pub async fn run<L>(
    mut listener: L,
    denylist: Option<String>,
    logging: LevelHandle,
    token: CancellationToken,
) -> Result<(), BridgeError>
where
    L: Accept + 'static,
{
    let pending = match handshake::accept_handshake(&mut listener, denylist.as_deref(), &token).await
    {
        Ok(pending) => pending,
        Err(HandshakeError::Canceled) => return Ok(()),
        // A shutdown mid-handshake surfaces as a read or write failure;
        // cancellation is still a clean exit.
        Err(_) if token.is_cancelled() => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let settings = pending.settings().clone();
    tracing::info!("Starting bridge for {}", settings.app_name);

    logging.set_level(&settings.logger.level)?;

    let mut tasks: JoinSet<Result<(), BridgeError>> = JoinSet::new();

    // Every listener must be bound before the ready ACK goes out, so the
    // enclave can start its servers without racing the bridge.
    for server_settings in &settings.servers {
        let tunnel = ServerTunnel::new(server_settings.clone());
        let tcp_listener = tunnel.bind().await?;
        tracing::info!(
            "Starting bridge server on TCP port {}",
            server_settings.bridge_tcp_port
        );
        let task_token = token.child_token();
        tasks.spawn(async move { tunnel.run(tcp_listener, task_token).await.map_err(Into::into) });
    }

    for client_settings in &settings.clients {
        let tunnel = ClientTunnel::new(client_settings.clone());
        let vsock_listener = tunnel.bind()?;
        tracing::info!(
            "Starting bridge client on vsock port {}",
            client_settings.enclave_dial_port
        );
        let task_token = token.child_token();
        tasks.spawn(async move {
            tunnel
                .run(vsock_listener, task_token)
                .await
                .map_err(Into::into)
        });
    }

    let watchdog = Watchdog::new(&settings.watchdog)?;
    // Ownership of the init-port listener transfers to the watchdog here.
    let task_token = token.child_token();
    tasks.spawn(async move {
        watchdog
            .run_server(listener, task_token)
            .await
            .map_err(Into::into)
    });

    if let Err(err) = pending.send_ready(&token).await {
        token.cancel();
        if matches!(err, HandshakeError::FinalAckFailed(protocol::io::IoError::Canceled)) {
            return Ok(());
        }
        return Err(err.into());
    }

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
    exit
}
