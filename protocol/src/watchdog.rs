//! Heartbeat watchdog between the bridge and the enclave.
//!
//! Both sides exchange the same 17-byte frame, the 16 raw bytes of the
//! enclave ID followed by LF, over the init-port connection that outlives
//! the handshake. Each side runs one frame reader and one frame writer per
//! connection; a ticker of period `interval` is reset on every matching
//! heartbeat. The symmetric framing makes the protocol testable over a
//! plain loopback socket.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::io;
use crate::settings::WatchdogSettings;
use crate::transport::Accept;

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("enclave ID is required")]
    EnclaveIdRequired,

    #[error("enclave heartbeat timeout: no heartbeat within {0:?}")]
    EnclaveHeartbeatTimeout(Duration),

    #[error("enclave ID mismatch: got {got}, expected {expected}")]
    EnclaveIdMismatch { got: Uuid, expected: Uuid },
}

pub type Result<T> = std::result::Result<T, WatchdogError>;

/// Liveness contract bound to one enclave identity.
#[derive(Clone, Debug)]
pub struct Watchdog {
    enclave_id: Uuid,
    interval: Duration,
}

impl Watchdog {
    pub fn new(settings: &WatchdogSettings) -> Result<Self> {
        if settings.enclave_id.is_nil() {
            return Err(WatchdogError::EnclaveIdRequired);
        }
        Ok(Self {
            enclave_id: settings.enclave_id,
            interval: settings.interval,
        })
    }

    /// Bridge role: accepts heartbeat connections on `listener`.
    ///
    /// Returns `Ok(())` when `token` fires, [`WatchdogError::EnclaveHeartbeatTimeout`]
    /// when no valid heartbeat arrives within the interval, and
    /// [`WatchdogError::EnclaveIdMismatch`] when a heartbeat carries the
    /// wrong identity. Accept errors are logged and the loop continues.
    pub async fn run_server<L>(&self, mut listener: L, token: CancellationToken) -> Result<()>
    where
        L: Accept + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(1);
        let accept_token = token.child_token();
        let dog = self.clone();
        let acceptor = tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = accept_token.cancelled() => return,
                    res = listener.accept() => match res {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::error!("Failed to accept watchdog connection: {}", err);
                            continue;
                        }
                    },
                };
                let dog = dog.clone();
                let events = events_tx.clone();
                let conn_token = accept_token.child_token();
                tokio::spawn(async move {
                    dog.handle_conn(conn, events, conn_token).await;
                });
            }
        });

        let result = self.wait_for_heartbeats(events_rx, &token).await;
        acceptor.abort();
        result
    }

    /// Enclave role: dials the bridge and keeps one heartbeat connection
    /// alive, reconnecting with exponential backoff on any loss.
    pub async fn run_client<S, D, F>(&self, dial: D, token: CancellationToken) -> Result<()>
    where
        D: Fn() -> F + Send + 'static,
        F: Future<Output = std::io::Result<S>> + Send,
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(1);
        let dial_token = token.child_token();
        let dog = self.clone();
        let dialer = tokio::spawn(async move {
            let mut retry = ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(100))
                .with_max_interval(dog.interval)
                .with_max_elapsed_time(None)
                .build();
            loop {
                let conn = match dial().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::error!("Watchdog dial failed: {}", err);
                        let delay = retry.next_backoff().unwrap_or(dog.interval);
                        tokio::select! {
                            _ = dial_token.cancelled() => return,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                };
                retry.reset();
                // The dialing side handles its connection synchronously;
                // handle_conn returning means the connection is gone.
                dog.handle_conn(conn, events_tx.clone(), dial_token.child_token())
                    .await;
                if dial_token.is_cancelled() {
                    return;
                }
            }
        });

        let result = self.wait_for_heartbeats(events_rx, &token).await;
        dialer.abort();
        result
    }

    async fn wait_for_heartbeats(
        &self,
        mut events: mpsc::Receiver<Result<()>>,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut deadline = Instant::now() + self.interval;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WatchdogError::EnclaveHeartbeatTimeout(self.interval));
                }
                event = events.recv() => match event {
                    Some(Ok(())) => deadline = Instant::now() + self.interval,
                    Some(Err(err)) => return Err(err),
                    // Senders only drop once the accept or dial task has
                    // been torn down, which happens on cancellation.
                    None => return Ok(()),
                },
            }
        }
    }

    /// Shared per-connection logic for both roles: one writer emitting a
    /// frame every `interval / 2`, one reader validating inbound frames.
    async fn handle_conn<S>(
        &self,
        conn: S,
        events: mpsc::Sender<Result<()>>,
        token: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(conn);

        let mut frame = self.enclave_id.into_bytes().to_vec();
        frame.push(b'\n');
        let beat_every = self.interval / 2;
        let writer_token = token.child_token();
        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(beat_every);
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => return,
                    _ = ticker.tick() => {
                        if write_half.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let mut reader = BufReader::new(read_half);
        loop {
            let frame = match io::read_until(&mut reader, b'\n', &token).await {
                Ok(frame) => frame,
                // Connection loss or cancellation; nothing to report.
                Err(_) => break,
            };
            let got = Uuid::from_slice(&frame[..frame.len() - 1]).unwrap_or(Uuid::nil());
            if got != self.enclave_id {
                let _ = events
                    .send(Err(WatchdogError::EnclaveIdMismatch {
                        got,
                        expected: self.enclave_id,
                    }))
                    .await;
                break;
            }
            let _ = events.send(Ok(())).await;
        }
        writer.abort();
        let _ = writer.await;
    }
}
