//! Vsock transport adapter.
//!
//! Thin wrapper over `AF_VSOCK` endpoints: dial a `(cid, port)` pair or bind
//! a listener on one. Connections are plain byte streams with the same
//! half-close semantics as TCP. Vsock only exists on Linux; elsewhere both
//! operations fail with [`TransportError::Unsupported`] and the type aliases
//! below keep callers compiling.

use std::future::Future;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Context ID of the host as seen from a Nitro enclave.
pub const HOST_CID: u32 = 3;
/// Wildcard context ID for listeners.
pub const ANY_CID: u32 = 0xffff_ffff;
/// Default port for the handshake (and, after it, the watchdog).
pub const INIT_PORT: u32 = 5000;
/// Default port for the stdout relay.
pub const STDOUT_PORT: u32 = 4999;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("vsock transport is only available on Linux")]
    Unsupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl From<TransportError> for std::io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(err) => err,
            TransportError::Unsupported => {
                std::io::Error::new(std::io::ErrorKind::Unsupported, err.to_string())
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub type VsockConnection = tokio_vsock::VsockStream;
#[cfg(target_os = "linux")]
pub type VsockAcceptor = tokio_vsock::VsockListener;

#[cfg(not(target_os = "linux"))]
pub type VsockConnection = TcpStream;
#[cfg(not(target_os = "linux"))]
pub type VsockAcceptor = TcpListener;

/// Dials the vsock endpoint `(cid, port)`.
#[cfg(target_os = "linux")]
pub async fn dial(cid: u32, port: u32) -> Result<VsockConnection> {
    let addr = tokio_vsock::VsockAddr::new(cid, port);
    Ok(tokio_vsock::VsockStream::connect(addr).await?)
}

/// Binds a vsock listener on `(cid, port)`.
#[cfg(target_os = "linux")]
pub fn listen(cid: u32, port: u32) -> Result<VsockAcceptor> {
    let addr = tokio_vsock::VsockAddr::new(cid, port);
    Ok(tokio_vsock::VsockListener::bind(addr)?)
}

#[cfg(not(target_os = "linux"))]
pub async fn dial(_cid: u32, _port: u32) -> Result<VsockConnection> {
    Err(TransportError::Unsupported)
}

#[cfg(not(target_os = "linux"))]
pub fn listen(_cid: u32, _port: u32) -> Result<VsockAcceptor> {
    Err(TransportError::Unsupported)
}

/// A byte-stream listener the bridge can accept peers from.
///
/// Implemented for both vsock and TCP listeners so that every accept loop in
/// the system can be exercised over loopback TCP in tests.
pub trait Accept: Send {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn accept(&mut self) -> impl Future<Output = std::io::Result<Self::Conn>> + Send;
}

impl Accept for TcpListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> std::io::Result<TcpStream> {
        let (conn, _) = TcpListener::accept(self).await?;
        Ok(conn)
    }
}

#[cfg(target_os = "linux")]
impl Accept for tokio_vsock::VsockListener {
    type Conn = tokio_vsock::VsockStream;

    async fn accept(&mut self) -> std::io::Result<tokio_vsock::VsockStream> {
        let (conn, _) = tokio_vsock::VsockListener::accept(self).await?;
        Ok(conn)
    }
}
