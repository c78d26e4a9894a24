//! Stdout tunnel: relays the enclave's log stream to the bridge's stdout.

use std::sync::Arc;

use protocol::transport::{self, Accept};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use super::splice::copy_with_pool;
use super::{BufferPool, TunnelError, BUF_SIZE};

/// One-directional relay: every accepted vsock connection is copied to the
/// process's standard output until EOF. Concurrent connections interleave at
/// arbitrary byte boundaries; log consumers bring their own framing.
pub struct StdoutTunnel {
    port: u32,
    pool: Arc<BufferPool>,
}

impl StdoutTunnel {
    pub fn new(port: u32) -> Self {
        Self {
            port,
            pool: Arc::new(BufferPool::new(BUF_SIZE)),
        }
    }

    /// Binds the vsock listener and relays to the process stdout.
    pub async fn run(&self, token: CancellationToken) -> Result<(), TunnelError> {
        let listener = transport::listen(transport::HOST_CID, self.port)?;
        tracing::info!("Stdout tunnel listening on vsock port {}", self.port);
        self.serve(listener, tokio::io::stdout, token).await
    }

    pub(crate) async fn serve<L, W, F>(
        &self,
        mut listener: L,
        make_writer: F,
        token: CancellationToken,
    ) -> Result<(), TunnelError>
    where
        L: Accept,
        W: AsyncWrite + Send + Unpin + 'static,
        F: Fn() -> W + Send + Sync + 'static,
    {
        let make_writer = Arc::new(make_writer);
        loop {
            let mut conn = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                res = listener.accept() => res.map_err(TunnelError::Accept)?,
            };

            let pool = self.pool.clone();
            let make_writer = make_writer.clone();
            tokio::spawn(async move {
                let mut writer = make_writer();
                if let Err(err) = copy_with_pool(&mut conn, &mut writer, &pool).await {
                    tracing::error!("Failed to copy enclave output to stdout: {}", err);
                }
            });
        }
    }
}
