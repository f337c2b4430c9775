//! Network configuration for a datamesh node.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the datamesh networking layer.
///
/// All values are read once at node construction; the core does not
/// re-validate or hot-reload them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to listen on for incoming peer connections.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Bootstrap seed addresses (`host:port`) used to join the network.
    pub bootstrap_peers: Vec<String>,

    /// Directory holding the persisted peer snapshot file.
    pub data_dir: PathBuf,

    /// Interval between health-check cycles.
    #[serde(with = "duration_serde")]
    pub health_check_interval: Duration,

    /// Only peers unseen for longer than this are actively probed.
    #[serde(with = "duration_serde")]
    pub probe_staleness: Duration,

    /// Timeout for a single liveness probe.
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,

    /// Peers unseen for longer than this are pruned outright.
    #[serde(with = "duration_serde")]
    pub prune_after: Duration,

    /// Interval between peer-exchange cycles.
    #[serde(with = "duration_serde")]
    pub peer_exchange_interval: Duration,

    /// Maximum peer entries per exchange response (both served and merged).
    pub peer_exchange_cap: usize,

    /// Interval between re-bootstrap checks.
    #[serde(with = "duration_serde")]
    pub rebootstrap_interval: Duration,

    /// Grace period before a re-bootstrap join is actually attempted.
    #[serde(with = "duration_serde")]
    pub rebootstrap_grace: Duration,

    /// Healthy-peer floor below which re-bootstrap triggers.
    pub min_peers: usize,

    /// Timeout for a single DHT RPC.
    #[serde(with = "duration_serde")]
    pub rpc_timeout: Duration,

    /// Kademlia replication factor (bucket capacity and store fan-out).
    pub replication_k: usize,

    /// Kademlia lookup parallelism.
    pub lookup_alpha: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8468".parse().expect("valid default listen address"),
            bootstrap_peers: Vec::new(),
            data_dir: PathBuf::from("./data"),
            health_check_interval: Duration::from_secs(60),
            probe_staleness: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            prune_after: Duration::from_secs(3600),
            peer_exchange_interval: Duration::from_secs(120),
            peer_exchange_cap: 100,
            rebootstrap_interval: Duration::from_secs(300),
            rebootstrap_grace: Duration::from_secs(30),
            min_peers: 3,
            rpc_timeout: Duration::from_secs(5),
            replication_k: 20,
            lookup_alpha: 3,
        }
    }
}

impl NetworkConfig {
    /// Path of the persisted peer snapshot file under `data_dir`.
    pub fn peers_file(&self) -> PathBuf {
        self.data_dir.join("known_peers.json")
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

pub(crate) mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.listen_addr.port(), 8468);
        assert_eq!(config.health_check_interval, Duration::from_secs(60));
        assert_eq!(config.peer_exchange_interval, Duration::from_secs(120));
        assert_eq!(config.rebootstrap_interval, Duration::from_secs(300));
        assert_eq!(config.min_peers, 3);
        assert_eq!(config.peer_exchange_cap, 100);
        assert!(config.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_peers_file_path() {
        let config = NetworkConfig::default();
        assert!(config.peers_file().ends_with("known_peers.json"));
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = NetworkConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.listen_addr, config.listen_addr);
        assert_eq!(deserialized.prune_after, config.prune_after);
        assert_eq!(deserialized.replication_k, config.replication_k);
    }

    #[test]
    fn test_config_save_load() {
        let dir = std::env::temp_dir().join("datamesh_test_config");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let path = dir.join("config.json");
        let mut original = NetworkConfig::default();
        original.min_peers = 5;
        original.bootstrap_peers = vec!["192.168.1.100:8468".to_string()];
        original.save_to_file(&path).unwrap();

        let loaded = NetworkConfig::load_or_default(&path);
        assert_eq!(loaded.min_peers, 5);
        assert_eq!(loaded.bootstrap_peers.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let path = std::env::temp_dir().join("datamesh_nonexistent_config.json");
        let _ = std::fs::remove_file(&path);

        let config = NetworkConfig::load_or_default(&path);
        assert_eq!(config.min_peers, 3);
    }
}
