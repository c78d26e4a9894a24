//! In-enclave side of the bridge.
//!
//! A workload running inside the enclave uses this crate to perform the
//! handshake with the host-side bridge, read its configuration from the
//! environment map the bridge hands over, point its logs at the bridge's
//! stdout relay, and keep the heartbeat alive for the process lifetime.
//!
//! Typical lifecycle: [`handshake::BridgeHandshake::connect`] dials the init
//! port with backoff and receives the environment; the workload derives its
//! settings from [`config::EnvMap`]; then
//! [`handshake::BridgeHandshake::finish_handshake_and_wait`] sends the
//! bridge settings, waits for the ready ACK, and heartbeats forever.

pub mod config;
pub mod error;
pub mod handshake;
pub mod logger;
pub mod tunnel;

pub use error::{EnclaveError, Result};
