//! Client tunnel: enclave egress to arbitrary TCP targets.
//!
//! The first line of every accepted vsock connection names the target as
//! `host:port`. The tunnel dials it, answers with an ACK so the enclave-side
//! dialer knows the path is through, and splices from there. The target is
//! treated as an opaque address: no DNS filtering, no allow-listing.

use std::sync::Arc;
use std::time::Duration;

use protocol::io;
use protocol::settings::ClientSettings;
use protocol::transport::{self, Accept, VsockAcceptor};
use protocol::ACK;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::{splice, BufferPool, TunnelError, BUF_SIZE};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ClientTunnel {
    port: u32,
    request_timeout: Duration,
    pool: Arc<BufferPool>,
}

impl ClientTunnel {
    pub fn new(settings: ClientSettings) -> Self {
        let request_timeout = if settings.request_timeout.is_zero() {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            settings.request_timeout
        };
        Self {
            port: settings.enclave_dial_port,
            request_timeout,
            pool: Arc::new(BufferPool::new(BUF_SIZE)),
        }
    }

    /// Binds the vsock listener for target requests.
    pub fn bind(&self) -> Result<VsockAcceptor, TunnelError> {
        let listener = transport::listen(transport::HOST_CID, self.port)?;
        tracing::info!("Listening for target requests on vsock port {}", self.port);
        Ok(listener)
    }

    pub async fn run<L>(&self, mut listener: L, token: CancellationToken) -> Result<(), TunnelError>
    where
        L: Accept,
    {
        loop {
            let conn = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                res = listener.accept() => res.map_err(TunnelError::Accept)?,
            };

            let request_timeout = self.request_timeout;
            let pool = self.pool.clone();
            let conn_token = token.child_token();
            tokio::spawn(async move {
                handle_conn(conn, request_timeout, pool, conn_token).await;
            });
        }
    }
}

async fn handle_conn<S>(
    conn: S,
    request_timeout: Duration,
    pool: Arc<BufferPool>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let request_token = io::with_deadline(&token, request_timeout);
    let mut conn = BufReader::new(conn);

    let line = match io::read_until(&mut conn, b'\n', &request_token).await {
        Ok(line) => line,
        Err(err) => {
            tracing::error!("Failed to read target address: {}", err);
            return;
        }
    };
    let target = match std::str::from_utf8(&line[..line.len() - 1]) {
        Ok(target) => target.to_string(),
        Err(err) => {
            tracing::error!("Target address is not valid UTF-8: {}", err);
            return;
        }
    };
    tracing::debug!("Received target request: {}", target);

    let target_conn = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(target_conn)) => target_conn,
        Ok(Err(err)) => {
            tracing::error!("Failed to dial target {}: {}", target, err);
            return;
        }
        Err(_) => {
            tracing::error!("Timed out dialing target {}", target);
            return;
        }
    };

    if let Err(err) = io::write_all(&mut conn, &ACK, &request_token).await {
        tracing::error!("Failed to write ACK for target {}: {}", target, err);
        return;
    }

    splice(conn, target_conn, &pool, &request_token).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_tunnel(request_timeout: Duration) -> ClientTunnel {
        ClientTunnel::new(ClientSettings {
            enclave_dial_port: 7001,
            request_timeout,
        })
    }

    #[test]
    fn zero_request_timeout_defaults_to_five_minutes() {
        let tunnel = test_tunnel(Duration::ZERO);
        assert_eq!(tunnel.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn acks_target_request_and_splices_payload() {
        // Harness TCP server standing in for the external target.
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let target_task = tokio::spawn(async move {
            let (mut conn, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            buf
        });

        // TCP listener standing in for the tunnel's vsock listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        let tunnel = test_tunnel(Duration::from_secs(30));
        let serve_token = token.clone();
        tokio::spawn(async move { tunnel.run(listener, serve_token).await });

        let mut enclave = tokio::net::TcpStream::connect(addr).await.unwrap();
        enclave
            .write_all(format!("{}\n", target_addr).as_bytes())
            .await
            .unwrap();

        let mut ack = [0u8; 2];
        enclave.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, ACK);

        enclave.write_all(b"hello").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), target_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"hello");

        token.cancel();
    }

    #[tokio::test]
    async fn drops_connection_when_target_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        let tunnel = test_tunnel(Duration::from_secs(30));
        let serve_token = token.clone();
        tokio::spawn(async move { tunnel.run(listener, serve_token).await });

        // A port nothing listens on; the dial fails and the tunnel closes
        // the connection without sending an ACK.
        let unreachable = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unreachable.local_addr().unwrap();
        drop(unreachable);

        let mut enclave = tokio::net::TcpStream::connect(addr).await.unwrap();
        enclave
            .write_all(format!("{}\n", dead_addr).as_bytes())
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), enclave.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);

        token.cancel();
    }
}
