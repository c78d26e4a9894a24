//! Bridge side of the initialization handshake.
//!
//! The exchange over the init port is strictly ordered: the enclave opens
//! with an ACK frame, the bridge answers with its environment as one JSON
//! line, the enclave returns its [`BridgeSettings`] line, and the bridge
//! closes with a final ACK once every tunnel listener is bound. A connection
//! whose first frame is not an ACK is discarded and the bridge keeps
//! listening; this keeps later heartbeat connections from being mistaken for
//! new handshakes.

use std::time::Duration;

use protocol::io::{self, IoError};
use protocol::settings::{self, BridgeSettings, SettingsError};
use protocol::transport::Accept;
use protocol::ACK;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_util::sync::CancellationToken;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    #[error("handshake canceled")]
    Canceled,

    #[error("first message from peer was not an ACK")]
    NoInitialAck,

    #[error("failed to serialize environment: {0}")]
    Environment(#[from] SettingsError),

    #[error("failed to write environment: {0}")]
    EnvWriteFailed(#[source] IoError),

    #[error("failed to read settings: {0}")]
    SettingsReadFailed(#[source] IoError),

    #[error("failed to parse settings: {0}")]
    SettingsParseFailed(#[source] SettingsError),

    #[error("enclave failed to configure: {0}")]
    EnclaveReportedError(String),

    #[error("failed to send ready ACK: {0}")]
    FinalAckFailed(#[source] IoError),
}

/// A completed settings exchange still waiting for its final ACK.
///
/// Holds the handshake connection open; [`PendingBridge::send_ready`] must
/// only be called once every tunnel listener derived from the settings is
/// bound.
#[derive(Debug)]
pub struct PendingBridge<S> {
    settings: BridgeSettings,
    conn: BufReader<S>,
}

impl<S> PendingBridge<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Sends the final ACK and closes the handshake connection.
    pub async fn send_ready(mut self, token: &CancellationToken) -> Result<(), HandshakeError> {
        tracing::debug!("Sending start ACK to enclave");
        io::write_all(&mut self.conn, &ACK, token)
            .await
            .map_err(HandshakeError::FinalAckFailed)
    }
}

/// Accepts connections until one completes the settings exchange.
///
/// The listener stays open on return; it is reused as the watchdog listener.
/// Accept errors are logged and the loop keeps going. A connection that does
/// not open with an ACK is dropped and the wait continues; any later failure
/// in the exchange is fatal.
pub async fn accept_handshake<L>(
    listener: &mut L,
    denylist: Option<&str>,
    token: &CancellationToken,
) -> Result<PendingBridge<L::Conn>, HandshakeError>
where
    L: Accept,
{
    tracing::info!("Waiting for new connection...");
    loop {
        let conn = tokio::select! {
            _ = token.cancelled() => return Err(HandshakeError::Canceled),
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!("Failed to accept handshake connection: {}", err);
                    continue;
                }
            },
        };

        match complete_handshake(conn, denylist, token).await {
            Ok(pending) => return Ok(pending),
            Err(HandshakeError::NoInitialAck) => {
                tracing::warn!("First message from peer was not an ACK, discarding connection");
            }
            Err(err) => return Err(err),
        }
    }
}

async fn complete_handshake<S>(
    conn: S,
    denylist: Option<&str>,
    token: &CancellationToken,
) -> Result<PendingBridge<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufReader::new(conn);

    let ack_token = io::with_deadline(token, READ_TIMEOUT);
    match io::read_until(&mut conn, b'\n', &ack_token).await {
        Ok(frame) if frame.as_slice() == ACK => {}
        _ => return Err(HandshakeError::NoInitialAck),
    }
    tracing::info!("Starting new bridge");

    tracing::info!("Sending environment to enclave");
    let environment = settings::serialize_environment(denylist)?;
    io::write_all(&mut conn, &environment, token)
        .await
        .map_err(HandshakeError::EnvWriteFailed)?;

    tracing::info!("Waiting for enclave to send bridge configuration");
    let read_token = io::with_deadline(token, READ_TIMEOUT);
    let line = io::read_until(&mut conn, b'\n', &read_token)
        .await
        .map_err(HandshakeError::SettingsReadFailed)?;
    let settings =
        BridgeSettings::from_line(&line).map_err(HandshakeError::SettingsParseFailed)?;
    if !settings.error.is_empty() {
        return Err(HandshakeError::EnclaveReportedError(settings.error));
    }

    Ok(PendingBridge { settings, conn })
}
