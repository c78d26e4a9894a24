//! Cancellation-aware byte I/O.
//!
//! Every read or write that can block on a handshake or watchdog socket goes
//! through these helpers so that a firing [`CancellationToken`] aborts the
//! operation instead of leaving a task wedged on a dead connection. The
//! caller keeps ownership of the connection and is responsible for closing
//! it.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("operation canceled")]
    Canceled,

    #[error("connection closed before delimiter")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IoError>;

/// Reads bytes up to and including `delim`, racing the token.
///
/// Returns [`IoError::Canceled`] if the token fires first and
/// [`IoError::UnexpectedEof`] if the stream ends before the delimiter.
pub async fn read_until<R>(
    reader: &mut R,
    delim: u8,
    token: &CancellationToken,
) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    tokio::select! {
        res = reader.read_until(delim, &mut buf) => {
            let n = res?;
            if n == 0 || buf.last() != Some(&delim) {
                return Err(IoError::UnexpectedEof);
            }
            Ok(buf)
        }
        _ = token.cancelled() => Err(IoError::Canceled),
    }
}

/// Writes the full buffer, racing the token.
pub async fn write_all<W>(
    writer: &mut W,
    data: &[u8],
    token: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        res = writer.write_all(data) => {
            res?;
            Ok(writer.flush().await?)
        }
        _ = token.cancelled() => Err(IoError::Canceled),
    }
}

/// Returns a child token that also fires after `timeout`.
///
/// Deadlines are expressed as cancellation so that every blocking operation
/// has a single abort path.
pub fn with_deadline(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn read_until_returns_delimited_frame() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let token = CancellationToken::new();

        tx.write_all(b"first\nsecond\n").await.unwrap();

        let mut reader = BufReader::new(rx);
        let line = read_until(&mut reader, b'\n', &token).await.unwrap();
        assert_eq!(line, b"first\n");
        let line = read_until(&mut reader, b'\n', &token).await.unwrap();
        assert_eq!(line, b"second\n");
    }

    #[tokio::test]
    async fn read_until_fails_on_eof_without_delimiter() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let token = CancellationToken::new();

        tx.write_all(b"partial").await.unwrap();
        drop(tx);

        let mut reader = BufReader::new(rx);
        let err = read_until(&mut reader, b'\n', &token).await.unwrap_err();
        assert!(matches!(err, IoError::UnexpectedEof));
    }

    #[tokio::test]
    async fn read_until_honors_cancellation() {
        let (_tx, rx) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        token.cancel();

        let mut reader = BufReader::new(rx);
        let err = read_until(&mut reader, b'\n', &token).await.unwrap_err();
        assert!(matches!(err, IoError::Canceled));
    }

    #[tokio::test]
    async fn deadline_token_fires_after_timeout() {
        let (_tx, rx) = tokio::io::duplex(64);
        let parent = CancellationToken::new();
        let token = with_deadline(&parent, Duration::from_millis(20));

        let mut reader = BufReader::new(rx);
        let err = read_until(&mut reader, b'\n', &token).await.unwrap_err();
        assert!(matches!(err, IoError::Canceled));
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn write_all_honors_cancellation() {
        // A tiny duplex buffer that is never drained forces the write to block.
        let (tx, _rx) = tokio::io::duplex(1);
        let token = CancellationToken::new();

        let mut writer = tx;
        writer.write_all(b"x").await.unwrap();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let err = write_all(&mut writer, &[0u8; 64], &token).await.unwrap_err();
        assert!(matches!(err, IoError::Canceled));
    }
}
