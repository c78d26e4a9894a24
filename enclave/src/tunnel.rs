//! Egress dialing through the bridge's client tunnel.
//!
//! The enclave reaches external TCP targets by dialing the bridge's client
//! tunnel port, naming the target as one `host:port` line, and waiting for
//! the bridge's ACK before treating the connection as a transport to the
//! target. Everything after the ACK is the raw byte stream.

use protocol::io;
use protocol::transport::{self, VsockConnection};
use protocol::ACK;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_util::sync::CancellationToken;

use crate::error::{EnclaveError, Result};

/// Dials `target` through the client tunnel on vsock `port`.
pub async fn dial_through_bridge(
    port: u32,
    target: &str,
    token: &CancellationToken,
) -> Result<BufReader<VsockConnection>> {
    let conn = transport::dial(transport::HOST_CID, port).await?;
    dial_target(conn, target, token).await
}

/// Sends the target line on an established tunnel connection and consumes
/// the bridge's ACK. The returned reader is the transport to the target.
pub async fn dial_target<S>(
    conn: S,
    target: &str,
    token: &CancellationToken,
) -> Result<BufReader<S>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut conn = BufReader::new(conn);
    io::write_all(&mut conn, format!("{target}\n").as_bytes(), token).await?;

    let response = io::read_until(&mut conn, b'\n', token).await?;
    if response.as_slice() != ACK {
        return Err(EnclaveError::MissingAck);
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn sends_target_line_and_consumes_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        let bridge = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(conn);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "example.com:443\n");

            reader.write_all(&ACK).await.unwrap();
            reader.write_all(b"payload").await.unwrap();
        });

        let conn = TcpStream::connect(addr).await.unwrap();
        let mut tunnel = dial_target(conn, "example.com:443", &token).await.unwrap();

        let mut payload = [0u8; 7];
        tunnel.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"payload");

        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_ack_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(conn);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader.write_all(b"NO\n").await.unwrap();
        });

        let conn = TcpStream::connect(addr).await.unwrap();
        let err = dial_target(conn, "example.com:443", &token)
            .await
            .unwrap_err();
        assert!(matches!(err, EnclaveError::MissingAck));
    }
}
