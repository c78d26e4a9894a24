//! Server tunnel: external TCP ingress into an enclave listener.

use std::future::Future;
use std::sync::Arc;

use protocol::settings::ServerSettings;
use protocol::transport::{self, Accept};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{splice, BufferPool, TunnelError, BUF_SIZE};

/// Forwards every TCP connection accepted on the bridge port into a fresh
/// vsock connection to `(enclave_cid, enclave_listen_port)`. The TCP stream
/// is delivered verbatim; the tunnel adds no framing of its own.
pub struct ServerTunnel {
    settings: ServerSettings,
    pool: Arc<BufferPool>,
}

impl ServerTunnel {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            pool: Arc::new(BufferPool::new(BUF_SIZE)),
        }
    }

    /// Binds the TCP listener on `0.0.0.0:bridge_tcp_port`.
    pub async fn bind(&self) -> Result<TcpListener, TunnelError> {
        let port = u16::try_from(self.settings.bridge_tcp_port)
            .map_err(|_| TunnelError::InvalidPort(self.settings.bridge_tcp_port))?;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!("Server tunnel listening on TCP port {}", port);
        Ok(listener)
    }

    /// Serves the listener, dialing the enclave for every accepted connection.
    pub async fn run(&self, listener: TcpListener, token: CancellationToken) -> Result<(), TunnelError> {
        let cid = self.settings.enclave_cid;
        let port = self.settings.enclave_listen_port;
        self.serve(
            listener,
            move || async move { transport::dial(cid, port).await.map_err(std::io::Error::from) },
            token,
        )
        .await
    }

    pub(crate) async fn serve<L, D, F, S>(
        &self,
        mut listener: L,
        dial: D,
        token: CancellationToken,
    ) -> Result<(), TunnelError>
    where
        L: Accept,
        D: Fn() -> F + Send + Sync + 'static,
        F: Future<Output = std::io::Result<S>> + Send,
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let dial = Arc::new(dial);
        loop {
            let conn = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                res = listener.accept() => res.map_err(TunnelError::Accept)?,
            };

            let pool = self.pool.clone();
            let dial = dial.clone();
            let conn_token = token.child_token();
            tokio::spawn(async move {
                let peer = match dial().await {
                    Ok(peer) => peer,
                    Err(err) => {
                        // Dropping the TCP connection closes it.
                        tracing::error!("Failed to dial enclave server: {}", err);
                        return;
                    }
                };
                splice(conn, peer, &pool, &conn_token).await;
            });
        }
    }
}
