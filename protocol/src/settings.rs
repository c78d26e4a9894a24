//! Handshake settings and environment serialization.
//!
//! [`BridgeSettings`] is the central artifact of the handshake: the enclave
//! builds one and sends it to the bridge as a single newline-terminated JSON
//! line, and everything the bridge spawns afterwards is derived from it.

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Environment variable overriding the default init port.
pub const INIT_PORT_ENV_VAR: &str = "ENCLAVE_BRIDGE_VSOCK_INIT_PORT";
/// Environment variable overriding the default stdout port.
pub const STDOUT_PORT_ENV_VAR: &str = "ENCLAVE_BRIDGE_VSOCK_STDOUT_PORT";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("invalid environment denylist: {0}")]
    InvalidDenylist(#[from] regex::Error),

    #[error("invalid port in {variable}: {value}")]
    InvalidPort { variable: String, value: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Configuration the enclave sends to the bridge during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    pub app_name: String,
    pub logger: LoggerSettings,
    pub watchdog: WatchdogSettings,
    pub servers: Vec<ServerSettings>,
    pub clients: Vec<ClientSettings>,
    /// Non-empty when the enclave failed to configure itself; the bridge
    /// aborts the handshake and never spawns tunnels.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Logger configuration for the bridge process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerSettings {
    /// Log level to apply on the bridge; empty leaves the level unchanged.
    pub level: String,
}

/// Identity and pacing of the heartbeat contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogSettings {
    pub enclave_id: Uuid,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl WatchdogSettings {
    /// Fresh identity with the standard 30 second interval.
    pub fn standard() -> Self {
        Self {
            enclave_id: Uuid::new_v4(),
            interval: Duration::from_secs(30),
        }
    }
}

/// One TCP port on the bridge forwarded into a listener inside the enclave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub enclave_cid: u32,
    pub enclave_listen_port: u32,
    pub bridge_tcp_port: u32,
}

/// One vsock port on the bridge that dials TCP targets for the enclave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub enclave_dial_port: u32,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl BridgeSettings {
    /// Serializes to the line-framed wire form: JSON followed by `\n`.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parses the line-framed wire form; a trailing `\n` is accepted.
    pub fn from_line(line: &[u8]) -> Result<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        Ok(serde_json::from_slice(line)?)
    }
}

/// Serializes the process environment as a newline-terminated JSON object.
///
/// Variables whose name matches `denylist` are removed. An invalid denylist
/// is a configuration error, not a silent passthrough.
pub fn serialize_environment(denylist: Option<&str>) -> Result<Vec<u8>> {
    let filter = denylist.map(Regex::new).transpose()?;
    let environment: BTreeMap<String, String> = std::env::vars()
        .filter(|(name, _)| !filter.as_ref().is_some_and(|re| re.is_match(name)))
        .collect();
    let mut bytes = serde_json::to_vec(&environment)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Init port, honoring `ENCLAVE_BRIDGE_VSOCK_INIT_PORT`.
pub fn init_port_from_env() -> Result<u32> {
    port_from_env(INIT_PORT_ENV_VAR, crate::transport::INIT_PORT)
}

/// Stdout port, honoring `ENCLAVE_BRIDGE_VSOCK_STDOUT_PORT`.
pub fn stdout_port_from_env() -> Result<u32> {
    port_from_env(STDOUT_PORT_ENV_VAR, crate::transport::STDOUT_PORT)
}

fn port_from_env(variable: &str, default: u32) -> Result<u32> {
    match std::env::var(variable) {
        Ok(value) => value.parse().map_err(|_| SettingsError::InvalidPort {
            variable: variable.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_line_round_trips() {
        let settings = BridgeSettings {
            app_name: "demo".to_string(),
            logger: LoggerSettings {
                level: "debug".to_string(),
            },
            watchdog: WatchdogSettings {
                enclave_id: Uuid::new_v4(),
                interval: Duration::from_secs(30),
            },
            servers: vec![ServerSettings {
                enclave_cid: 16,
                enclave_listen_port: 5001,
                bridge_tcp_port: 8080,
            }],
            clients: vec![ClientSettings {
                enclave_dial_port: 5002,
                request_timeout: Duration::from_secs(300),
            }],
            error: String::new(),
        };

        let line = settings.to_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(BridgeSettings::from_line(&line).unwrap(), settings);
    }

    #[test]
    fn settings_parse_handshake_frame() {
        let line = br#"{"appName":"t","watchdog":{"enclaveId":"11111111-1111-1111-1111-111111111111","interval":"1s"},"logger":{"level":"info"},"servers":[],"clients":[]}
"#;
        let settings = BridgeSettings::from_line(line).unwrap();
        assert_eq!(settings.app_name, "t");
        assert_eq!(settings.logger.level, "info");
        assert_eq!(settings.watchdog.interval, Duration::from_secs(1));
        assert_eq!(
            settings.watchdog.enclave_id,
            "11111111-1111-1111-1111-111111111111"
                .parse::<uuid::Uuid>()
                .unwrap()
        );
        assert!(settings.error.is_empty());
    }

    #[test]
    fn empty_error_is_not_serialized() {
        let settings = BridgeSettings::default();
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("error"));

        let settings = BridgeSettings {
            error: "no keys available".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains(r#""error":"no keys available""#));
    }

    #[test]
    fn environment_serialization_applies_denylist() {
        std::env::set_var("BRIDGE_TEST_KEEP", "1");
        std::env::set_var("BRIDGE_TEST_SECRET", "hunter2");

        let bytes = serialize_environment(Some("^BRIDGE_TEST_SECRET$")).unwrap();
        let env: BTreeMap<String, String> =
            serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(env.get("BRIDGE_TEST_KEEP").map(String::as_str), Some("1"));
        assert!(!env.contains_key("BRIDGE_TEST_SECRET"));
    }

    #[test]
    fn invalid_denylist_is_rejected() {
        let err = serialize_environment(Some("(unclosed")).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidDenylist(_)));
    }

    #[test]
    fn standard_watchdog_settings_are_valid() {
        let settings = WatchdogSettings::standard();
        assert!(!settings.enclave_id.is_nil());
        assert_eq!(settings.interval, Duration::from_secs(30));
    }
}
