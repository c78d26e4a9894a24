//! Tunnels between the external network and the enclave.
//!
//! Every tunnel is one long-lived listener whose accepted connections are
//! spliced to a peer connection on the other transport. Per-connection
//! failures are logged and dropped; a failing accept takes the whole tunnel
//! down.

mod client;
mod server;
mod splice;
mod stdout;

pub use client::ClientTunnel;
pub use server::ServerTunnel;
pub use splice::{splice, BufferPool};
pub use stdout::StdoutTunnel;

use protocol::transport::TransportError;
use thiserror::Error;

/// Size of the copy buffers drawn from each tunnel's pool.
pub const BUF_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("invalid TCP port: {0}")]
    InvalidPort(u32),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
