//! Typed access to the environment map received during the handshake.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(String),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: String, value: String },
}

/// The environment the bridge serialized during the handshake.
///
/// The bridge forwards its own process environment verbatim (minus any
/// denylisted names), so the accessors here mirror reading `std::env::var`
/// on the host.
#[derive(Debug, Clone, Default)]
pub struct EnvMap(HashMap<String, String>);

impl EnvMap {
    pub fn new(vars: HashMap<String, String>) -> Self {
        Self(vars)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn require(&self, name: &str) -> Result<&str, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }

    /// Parses an optional variable; `Ok(None)` when it is absent.
    pub fn get_parsed<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Invalid {
                    name: name.to_string(),
                    value: value.to_string(),
                }),
        }
    }

    pub fn require_parsed<T: FromStr>(&self, name: &str) -> Result<T, ConfigError> {
        self.get_parsed(name)?
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
