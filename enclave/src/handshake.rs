//! Enclave side of the initialization handshake.
//!
//! The enclave dials the bridge's init port with exponential backoff, opens
//! with an ACK frame, and receives the host environment as one JSON line.
//! Once the workload has derived its configuration, it finishes the
//! handshake by sending the bridge settings and waiting for the ready ACK;
//! from then on the same dialer feeds the heartbeat loop for the rest of
//! the process lifetime.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use protocol::io::{self, IoError};
use protocol::settings::BridgeSettings;
use protocol::transport::{self, VsockConnection};
use protocol::watchdog::Watchdog;
use protocol::ACK;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::EnvMap;
use crate::error::{EnclaveError, Result};

const DIAL_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const DIAL_MAX_BACKOFF: Duration = Duration::from_secs(5);
const READY_TIMEOUT: Duration = Duration::from_secs(30);

pub type DialFuture<S> = Pin<Box<dyn Future<Output = std::io::Result<S>> + Send>>;
pub type Dialer<S> = Box<dyn Fn() -> DialFuture<S> + Send + Sync>;

/// Dialer for the bridge's init port over vsock.
pub fn init_dialer(init_port: u32) -> Dialer<VsockConnection> {
    Box::new(move || -> DialFuture<VsockConnection> {
        Box::pin(async move {
            transport::dial(transport::HOST_CID, init_port)
                .await
                .map_err(std::io::Error::from)
        })
    })
}

/// Handshake client state between the environment exchange and the final ACK.
pub struct BridgeHandshake<S> {
    dial: Dialer<S>,
    conn: Option<BufReader<S>>,
    environment: EnvMap,
}

impl<S> BridgeHandshake<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Dials the bridge until the first two handshake frames complete.
    ///
    /// Retries with exponential backoff and jitter; only cancellation stops
    /// the attempts.
    pub async fn connect(dial: Dialer<S>, token: &CancellationToken) -> Result<Self> {
        let mut retry = ExponentialBackoffBuilder::new()
            .with_initial_interval(DIAL_INITIAL_BACKOFF)
            .with_max_interval(DIAL_MAX_BACKOFF)
            .with_max_elapsed_time(None)
            .build();

        loop {
            match Self::try_connect(&dial, token).await {
                Ok((conn, environment)) => {
                    return Ok(Self {
                        dial,
                        conn: Some(conn),
                        environment,
                    });
                }
                Err(err) => {
                    if token.is_cancelled() {
                        return Err(err);
                    }
                    tracing::error!("Connection setup failed: {}", err);
                    let delay = retry.next_backoff().unwrap_or(DIAL_MAX_BACKOFF);
                    tokio::select! {
                        _ = token.cancelled() => return Err(err),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn try_connect(
        dial: &Dialer<S>,
        token: &CancellationToken,
    ) -> Result<(BufReader<S>, EnvMap)> {
        let conn = dial().await.map_err(EnclaveError::Dial)?;
        let mut conn = BufReader::new(conn);

        io::write_all(&mut conn, &ACK, token).await?;

        let line = io::read_until(&mut conn, b'\n', token).await?;
        let vars: HashMap<String, String> = serde_json::from_slice(&line[..line.len() - 1])?;
        Ok((conn, EnvMap::new(vars)))
    }

    /// The environment the bridge serialized in frame 2.
    pub fn environment(&self) -> &EnvMap {
        &self.environment
    }

    /// Sends the settings frame and waits for the ready ACK.
    ///
    /// Returning means every tunnel listener on the bridge is bound, so the
    /// workload can safely start its own servers. The returned heartbeat
    /// client must be kept running for the rest of the process lifetime.
    pub async fn finish_handshake(
        mut self,
        settings: &BridgeSettings,
        token: &CancellationToken,
    ) -> Result<HeartbeatClient<S>> {
        let mut conn = self
            .conn
            .take()
            .ok_or(EnclaveError::ConnectionNotEstablished)?;

        io::write_all(&mut conn, &settings.to_line()?, token).await?;

        let ack_token = io::with_deadline(token, READY_TIMEOUT);
        let frame = io::read_until(&mut conn, b'\n', &ack_token)
            .await
            .map_err(|err| match err {
                IoError::Canceled if !token.is_cancelled() => EnclaveError::FinalAckTimeout,
                other => other.into(),
            })?;
        if frame.as_slice() != ACK {
            return Err(EnclaveError::MissingAck);
        }
        tracing::info!("Bridge is ready");

        let watchdog = Watchdog::new(&settings.watchdog)?;
        Ok(HeartbeatClient {
            watchdog,
            dial: self.dial,
        })
    }

    /// Finishes the handshake and runs the heartbeat client until
    /// cancellation. Runs for the process lifetime.
    pub async fn finish_handshake_and_wait(
        self,
        settings: &BridgeSettings,
        token: CancellationToken,
    ) -> Result<()> {
        let heartbeat = self.finish_handshake(settings, &token).await?;
        heartbeat.run(token).await
    }

    /// Reports a fatal enclave-side failure by sending a settings frame
    /// whose error field is set, then closes the connection.
    pub async fn abort(
        mut self,
        error: impl Into<String>,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut conn = self
            .conn
            .take()
            .ok_or(EnclaveError::ConnectionNotEstablished)?;
        let settings = BridgeSettings {
            error: error.into(),
            ..Default::default()
        };
        io::write_all(&mut conn, &settings.to_line()?, token).await?;
        Ok(())
    }
}

/// Heartbeat client handed back once the bridge has acknowledged the
/// settings. Dials the init port, which the bridge reuses for heartbeats.
pub struct HeartbeatClient<S> {
    watchdog: Watchdog,
    dial: Dialer<S>,
}

impl<S> HeartbeatClient<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Runs until cancellation; any watchdog failure is fatal.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        Ok(self.watchdog.run_client(self.dial, token).await?)
    }
}
