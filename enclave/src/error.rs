use protocol::io::IoError;
use protocol::settings::SettingsError;
use protocol::transport::TransportError;
use protocol::watchdog::WatchdogError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum EnclaveError {
    #[error("connection not established")]
    ConnectionNotEstablished,

    #[error("missing ACK from bridge")]
    MissingAck,

    #[error("timed out waiting for the bridge's ready ACK")]
    FinalAckTimeout,

    #[error("failed to dial bridge: {0}")]
    Dial(#[source] std::io::Error),

    #[error("read/write failed: {0}")]
    Io(#[from] IoError),

    #[error("failed to parse environment: {0}")]
    Environment(#[from] serde_json::Error),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("watchdog error: {0}")]
    Watchdog(#[from] WatchdogError),
}

pub type Result<T> = std::result::Result<T, EnclaveError>;
