//! Relay configuration record.
//!
//! Assembled by the daemon's flag/file loader and handed read-only to the
//! subsystems that need it.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TLS_PORT: u16 = 7275;
pub const DEFAULT_MESH_PORT: u16 = 7276;
pub const DEFAULT_MESH_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 0, 7, 2);
pub const DEFAULT_MESH_INTERFACE: &str = "bat0";
pub const DEFAULT_MAX_CLIENTS: usize = 100;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 65536;
pub const DEFAULT_POW_DIFFICULTY: u8 = 20;
pub const DEFAULT_BUFFER_SIZE: usize = 50;
pub const DEFAULT_DEDUP_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// TLS listen port for client sessions.
    pub tls_port: u16,

    /// Mesh datagram endpoint.
    pub mesh_port: u16,
    pub mesh_multicast: Ipv4Addr,
    pub mesh_interface: String,

    /// Persistent-state directories (may coincide).
    pub cert_dir: PathBuf,
    pub key_dir: PathBuf,

    /// Upper bound on concurrent sessions; excess is rejected at accept.
    pub max_clients: usize,

    /// Hard cap on frame payload length.
    pub max_packet_size: usize,

    /// Per-session token bucket.
    pub client_packets_per_sec: f64,
    pub client_burst_size: f64,

    /// Aggregate token bucket.
    pub global_packets_per_sec: f64,
    pub global_burst_size: f64,

    /// Required leading zero bits in the PoW hash.
    pub pow_difficulty: u8,

    /// Capacity of the store-and-forward ring buffer.
    pub buffer_size: usize,

    /// Capacity trigger for the dedup reset.
    pub dedup_max_entries: usize,

    /// Suggested client PING cadence; the server only enforces the timeout.
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub handshake_timeout_secs: u64,

    /// Permitted client attestation hashes (hex). Empty accepts any.
    pub allowed_cert_hashes: HashSet<String>,

    /// Hex CA root public key. None runs the mesh open.
    pub ca_pubkey: Option<String>,

    /// Revocation list file, polled for changes.
    pub crl_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tls_port: DEFAULT_TLS_PORT,
            mesh_port: DEFAULT_MESH_PORT,
            mesh_multicast: DEFAULT_MESH_MULTICAST,
            mesh_interface: DEFAULT_MESH_INTERFACE.to_string(),
            cert_dir: PathBuf::from("."),
            key_dir: PathBuf::from("."),
            max_clients: DEFAULT_MAX_CLIENTS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            client_packets_per_sec: 10.0,
            client_burst_size: 20.0,
            global_packets_per_sec: 100.0,
            global_burst_size: 200.0,
            pow_difficulty: DEFAULT_POW_DIFFICULTY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            dedup_max_entries: DEFAULT_DEDUP_MAX_ENTRIES,
            keepalive_interval_secs: 30,
            keepalive_timeout_secs: 90,
            handshake_timeout_secs: 30,
            allowed_cert_hashes: HashSet::new(),
            ca_pubkey: None,
            crl_path: None,
        }
    }
}

impl RelayConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = RelayConfig::default();
        assert_eq!(config.tls_port, 7275);
        assert_eq!(config.mesh_port, 7276);
        assert_eq!(config.mesh_multicast, Ipv4Addr::new(239, 0, 7, 2));
        assert_eq!(config.mesh_interface, "bat0");
        assert_eq!(config.max_packet_size, 65536);
        assert_eq!(config.pow_difficulty, 20);
        assert_eq!(config.keepalive_timeout(), Duration::from_secs(90));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
        assert!(config.allowed_cert_hashes.is_empty());
        assert!(config.ca_pubkey.is_none());
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"tls_port": 9000, "pow_difficulty": 8}"#).expect("parse");
        assert_eq!(config.tls_port, 9000);
        assert_eq!(config.pow_difficulty, 8);
        assert_eq!(config.mesh_port, DEFAULT_MESH_PORT);
    }
}
