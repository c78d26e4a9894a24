//! Workload logging over the stdout tunnel.
//!
//! The bridge relays every byte it accepts on the stdout port to its own
//! standard output, so pointing a `tracing` subscriber at this writer makes
//! enclave logs appear in the host's log stream.

use protocol::transport;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing_subscriber::fmt::MakeWriter;

use crate::error::Result;

/// Writer factory that relays log lines to the bridge's stdout tunnel.
///
/// Log writes never block the caller: chunks are queued on a channel and a
/// background task drains them into the vsock connection. If the connection
/// dies, further writes are dropped silently; logging must not take the
/// workload down.
pub struct StdoutTunnelWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl StdoutTunnelWriter {
    /// Dials the stdout tunnel on the host and spawns the relay task.
    pub async fn connect(port: u32) -> Result<Self> {
        let conn = transport::dial(transport::HOST_CID, port).await?;
        Ok(Self::from_stream(conn))
    }

    /// Dials the default stdout port.
    pub async fn connect_default() -> Result<Self> {
        Self::connect(transport::STDOUT_PORT).await
    }

    fn from_stream<S>(mut conn: S) -> Self
    where
        S: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if conn.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });
        Self { tx }
    }
}

impl<'a> MakeWriter<'a> for StdoutTunnelWriter {
    type Writer = ChannelWriter;

    fn make_writer(&'a self) -> Self::Writer {
        ChannelWriter(self.tx.clone())
    }
}

pub struct ChannelWriter(mpsc::UnboundedSender<Vec<u8>>);

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.0.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn relays_written_bytes_to_the_stream() {
        let (tx, mut rx) = tokio::io::duplex(1024);
        let writer = StdoutTunnelWriter::from_stream(tx);

        let mut sink = writer.make_writer();
        sink.write_all(b"line\n").unwrap();

        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(1), rx.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"line\n");
    }

    #[tokio::test]
    async fn writes_after_stream_loss_do_not_fail() {
        let (tx, rx) = tokio::io::duplex(1024);
        let writer = StdoutTunnelWriter::from_stream(tx);
        drop(rx);

        let mut sink = writer.make_writer();
        // The relay task exits on the broken stream; writes keep succeeding.
        for _ in 0..10 {
            sink.write_all(b"dropped\n").unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
