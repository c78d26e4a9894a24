//! Tracing setup with a reloadable level filter.
//!
//! The handshake settings may carry a log level chosen by the enclave; the
//! bridge applies it to the already-installed subscriber through the reload
//! handle returned by [`init`].

use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

#[derive(Error, Debug)]
#[error("failed to set log level: {0}")]
pub struct LogLevelError(String);

/// Installs the global subscriber and returns the level reload handle.
pub fn init() -> LevelHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    LevelHandle { handle }
}

pub struct LevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

#[cfg(test)]
pub(crate) fn test_handle() -> (LevelHandle, reload::Layer<EnvFilter, Registry>) {
    let (layer, handle) = reload::Layer::new(EnvFilter::new("info"));
    (LevelHandle { handle }, layer)
}

impl LevelHandle {
    /// Applies the level from the handshake settings; an empty level leaves
    /// the current filter unchanged.
    pub fn set_level(&self, level: &str) -> Result<(), LogLevelError> {
        if level.is_empty() {
            return Ok(());
        }
        let filter = EnvFilter::try_new(level).map_err(|err| LogLevelError(err.to_string()))?;
        self.handle
            .reload(filter)
            .map_err(|err| LogLevelError(err.to_string()))?;
        tracing::info!("Log level set to {}", level);
        Ok(())
    }
}
