//! Process-wide configuration (the persisted server settings) and the `Context` the core is
//! constructed from.
//!
//! "Settings" and "logging" are external collaborators, not part of the core: `Context` is
//! explicit dependency injection, loaded once by the binary and handed down rather than read as
//! a global. `ServerConfig::load` uses `serdeconv` over a raw `toml` crate.

use crate::crypto::keys::StaticKeyPair;
use crate::logging::Logger;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 28012;
/// Default for the persisted `Sphynx.Server.KernelReceiveBuffer` setting.
pub const DEFAULT_KERNEL_RECEIVE_BUFFER_BYTES: u32 = 8_000_000;
const DEFAULT_WORKER_COUNT: usize = 4;

/// TOML file `sphynx-server` loads at startup. Field names are idiomatic snake_case rather than
/// the persisted settings' literal dotted keys (`Sphynx.Server.SupportIPv6`); the values and
/// defaults are unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default)]
    pub support_ipv6: bool,
    #[serde(default = "default_kernel_receive_buffer")]
    pub kernel_receive_buffer_bytes: u32,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Path to the persisted static key-pair file (as written by `sphynx-keygen`).
    pub key_file: String,
    /// Path to the 32-byte out-of-band pre-shared session key.
    pub session_key_file: String,
}

fn default_kernel_receive_buffer() -> u32 {
    DEFAULT_KERNEL_RECEIVE_BUFFER_BYTES
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: DEFAULT_PORT,
            support_ipv6: false,
            kernel_receive_buffer_bytes: DEFAULT_KERNEL_RECEIVE_BUFFER_BYTES,
            worker_count: default_worker_count(),
            key_file: "sphynx.key".into(),
            session_key_file: "sphynx.session".into(),
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("error loading sphynx-server configuration file")
    }
}

/// Explicit dependency-injection bundle the core is constructed from. No
/// process-wide singleton holds any of this.
pub struct Context {
    pub port: u16,
    pub support_ipv6: bool,
    pub kernel_receive_buffer_bytes: u32,
    pub worker_count: usize,
    pub key_pair: StaticKeyPair,
    pub session_key: [u8; 32],
    pub logger: Logger,
}

impl Context {
    pub fn from_config(config: &ServerConfig, key_pair: StaticKeyPair, session_key: [u8; 32], logger: Logger) -> Context {
        Context {
            port: config.port,
            support_ipv6: config.support_ipv6,
            kernel_receive_buffer_bytes: config.kernel_receive_buffer_bytes,
            worker_count: config.worker_count,
            key_pair,
            session_key,
            logger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.support_ipv6, false);
        assert_eq!(config.kernel_receive_buffer_bytes, DEFAULT_KERNEL_RECEIVE_BUFFER_BYTES);
    }

    #[test]
    fn deserializes_minimal_toml_with_defaults() {
        let toml = r#"
            port = 9000
            key_file = "k.bin"
            session_key_file = "s.bin"
        "#;
        let config: ServerConfig = serdeconv::from_toml_str(toml).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.support_ipv6, false);
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
    }
}
