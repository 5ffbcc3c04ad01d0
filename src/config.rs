//! Configuration surface for the node's transport layer.
//!
//! Mirrors the `Incoming/MMTP`, `Outgoing/MMTP`, and `Server` sections the
//! original node reads from its on-disk config: bind address, bandwidth
//! limiting, outbound admission, idle timeout, and send-ordering strategy.
//! Loading, validation, and directory/keystore concerns above this layer are
//! out of scope; this module only knows how to parse its own section.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

fn default_max_connections() -> usize {
    16
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_listen_ip() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

/// Top-level configuration for the transport layer of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Inbound listener configuration.
    pub incoming: IncomingConfig,
    /// Outbound dispatcher configuration.
    pub outgoing: OutgoingConfig,
    /// Bandwidth and idle-timeout configuration shared by both directions.
    pub server: ServerConfig,
    /// TLS certificate and key material.
    pub tls: TlsPaths,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            incoming: IncomingConfig::default(),
            outgoing: OutgoingConfig::default(),
            server: ServerConfig::default(),
            tls: TlsPaths::default(),
        }
    }
}

impl TransportConfig {
    /// Load configuration from a TOML file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(e.to_string()))
    }

    /// Idle timeout as a [`Duration`], if connections are subject to aging.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }
}

/// `Incoming/MMTP` section: where the node listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingConfig {
    /// IP address to bind the MTP listener to.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,
    /// Port to bind the MTP listener to.
    pub port: u16,
    /// When set, SEND packets are acknowledged with REJECTED instead of
    /// being handed to the packet sink. Grounded in
    /// `MMTPServerConnection.rejectPackets`.
    pub reject_packets: bool,
}

impl Default for IncomingConfig {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            port: 48099,
            reject_packets: false,
        }
    }
}

/// `Outgoing/MMTP` section: admission control for the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutgoingConfig {
    /// Maximum number of concurrently open outbound connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for OutgoingConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

/// `Server` section: bandwidth limiting, idle timeout, throughput mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Average bytes/sec the reactor may spend across all connections.
    /// `None` disables bandwidth limiting entirely.
    pub max_bandwidth: Option<u64>,
    /// Maximum burst size in bytes. Defaults to `5 * max_bandwidth * TICK`
    /// when unset and bandwidth limiting is enabled.
    pub max_bandwidth_spike: Option<u64>,
    /// Seconds of inactivity before a connection is aged out.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// When true, the client engine may keep one unacknowledged frame in
    /// flight instead of serializing send/ack pairs.
    pub optimize_throughput: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_bandwidth: None,
            max_bandwidth_spike: None,
            timeout_secs: default_timeout_secs(),
            optimize_throughput: false,
        }
    }
}

/// TLS material. Certificate/key rotation and keystore management live
/// above this layer; this struct only names the paths to load at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsPaths {
    /// PEM certificate chain presented to peers.
    pub cert_path: String,
    /// PEM private key matching `cert_path`.
    pub key_path: String,
}

impl Default for TlsPaths {
    fn default() -> Self {
        Self {
            cert_path: "mtp-cert.pem".to_string(),
            key_path: "mtp-key.pem".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.outgoing.max_connections, 16);
        assert!(cfg.server.max_bandwidth.is_none());
        assert!(!cfg.server.optimize_throughput);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let text = r#"
            [incoming]
            port = 48099

            [outgoing]
            max_connections = 4

            [server]
            max_bandwidth = 1048576
        "#;
        let cfg = TransportConfig::from_toml(text).unwrap();
        assert_eq!(cfg.incoming.port, 48099);
        assert_eq!(cfg.outgoing.max_connections, 4);
        assert_eq!(cfg.server.max_bandwidth, Some(1_048_576));
        assert_eq!(cfg.server.timeout_secs, default_timeout_secs());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(TransportConfig::from_toml("not = [valid").is_err());
    }
}
