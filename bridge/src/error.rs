use protocol::settings::SettingsError;
use protocol::transport::TransportError;
use protocol::watchdog::WatchdogError;
use thiserror::Error;

use crate::handshake::HandshakeError;
use crate::logging::LogLevelError;
use crate::tunnel::TunnelError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("watchdog failed: {0}")]
    Watchdog(#[from] WatchdogError),

    #[error("tunnel failed: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("configuration error: {0}")]
    Settings(#[from] SettingsError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    LogLevel(#[from] LogLevelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
