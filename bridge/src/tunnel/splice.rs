//! Bidirectional splicer.
//!
//! Copies bytes between two connections in both directions until either side
//! closes or the cancellation token fires; both connections are closed on
//! every exit path. Copy buffers come from a per-tunnel pool so that
//! steady-state traffic does not allocate per connection.

use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Pool of fixed-size copy buffers shared by all connections of one tunnel.
///
/// A borrowed buffer is owned exclusively by one copy direction until it is
/// returned.
pub struct BufferPool {
    size: usize,
    buffers: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            buffers: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> Box<[u8]> {
        self.buffers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size].into_boxed_slice())
    }

    fn put(&self, buf: Box<[u8]>) {
        self.buffers.lock().unwrap().push(buf);
    }
}

/// Splices `a` and `b` until either direction ends or `token` fires.
///
/// Copy errors are logged, not propagated: the owning accept loop keeps
/// serving other connections. Dropping the halves on return closes both
/// connections exactly once.
pub async fn splice<A, B>(a: A, b: B, pool: &BufferPool, token: &CancellationToken)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        res = copy_with_pool(&mut a_read, &mut b_write, pool) => log_copy_end("outbound", res),
        res = copy_with_pool(&mut b_read, &mut a_write, pool) => log_copy_end("inbound", res),
        _ = token.cancelled() => {}
    }
}

fn log_copy_end(direction: &str, result: std::io::Result<u64>) {
    match result {
        Ok(bytes) => tracing::debug!("Connection closed, {} bytes {}", bytes, direction),
        Err(err) => tracing::error!("Failed to copy {} data: {}", direction, err),
    }
}

/// Copies `reader` to `writer` through one pooled buffer until EOF.
pub(crate) async fn copy_with_pool<R, W>(
    reader: &mut R,
    writer: &mut W,
    pool: &BufferPool,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut total = 0u64;
    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => {
                if let Err(err) = writer.write_all(&buf[..n]).await {
                    break Err(err);
                }
                total += n as u64;
            }
            Err(err) => break Err(err),
        }
    };
    pool.put(buf);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn splice_round_trips_bytes_in_both_directions() {
        let (mut client, bridge_a) = tokio::io::duplex(128 * 1024);
        let (bridge_b, mut server) = tokio::io::duplex(128 * 1024);
        let pool = BufferPool::new(super::super::BUF_SIZE);
        let token = CancellationToken::new();

        let task = tokio::spawn(async move {
            splice(bridge_a, bridge_b, &pool, &token).await;
        });

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; payload.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        server.write_all(b"reply").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        drop(client);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn splice_stops_when_token_fires() {
        let (_client, bridge_a) = tokio::io::duplex(64);
        let (bridge_b, _server) = tokio::io::duplex(64);
        let pool = BufferPool::new(super::super::BUF_SIZE);
        let token = CancellationToken::new();

        let splice_token = token.clone();
        let task = tokio::spawn(async move {
            splice(bridge_a, bridge_b, &pool, &splice_token).await;
        });

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn buffer_pool_reuses_returned_buffers() {
        let pool = BufferPool::new(8);
        let buf = pool.get();
        assert_eq!(buf.len(), 8);
        pool.put(buf);
        let _again = pool.get();
        assert!(pool.buffers.lock().unwrap().is_empty());
    }
}
