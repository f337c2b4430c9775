//! Peer record store — the single owner of known-peer state.
//!
//! Every background task (health monitor, peer exchange, bootstrap) and
//! the node façade mutate peer state only through this store, shared as
//! an `Arc<RwLock<PeerStore>>`. Query methods return clones so callers
//! never hold references into the table while another task writes to it.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NetworkError;

/// Seconds a peer may go unseen before it stops counting as healthy.
const HEALTHY_MAX_AGE_SECS: f64 = 300.0;
/// Attempt count below which a peer gets the new-peer grace window.
const HEALTHY_GRACE_ATTEMPTS: u64 = 5;
/// Success ratio a peer must exceed once past the grace window.
const HEALTHY_MIN_RATE: f64 = 0.5;
/// Only peers seen within this window are written to the snapshot file.
const PERSIST_MAX_AGE_SECS: f64 = 86_400.0;

/// Current wall-clock time as fractional unix seconds.
pub(crate) fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Parse a peer address into `(host, port)`.
///
/// Accepts bare `host:port` as well as `ws://`, `http://` and
/// `https://` prefixed forms.
pub fn parse_address(addr: &str) -> Result<(String, u16), NetworkError> {
    let cleaned = addr
        .trim()
        .trim_start_matches("ws://")
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');

    let (host, port_str) = cleaned
        .rsplit_once(':')
        .ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()))?;

    if host.is_empty() {
        return Err(NetworkError::InvalidAddress(addr.to_string()));
    }

    let port: u16 = port_str
        .parse()
        .map_err(|_| NetworkError::InvalidAddress(addr.to_string()))?;

    Ok((host.to_string(), port))
}

/// One known remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Host part of the peer's dialable address.
    pub host: String,
    /// Port part of the peer's dialable address.
    pub port: u16,
    /// Node ID reported by the peer; absent before first contact.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Unix timestamp (seconds) of the last successful response.
    pub last_seen: f64,
    /// Successful contacts since first observation.
    pub success_count: u64,
    /// Failed contacts since first observation.
    pub failure_count: u64,
    /// Most recent measured round-trip time.
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

impl PeerRecord {
    /// Create a fresh record for a peer that has just been contacted.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            node_id: None,
            last_seen: 0.0,
            success_count: 0,
            failure_count: 0,
            latency_ms: None,
        }
    }

    /// The `host:port` key of this record.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Fraction of contacts that succeeded (0 when never contacted).
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }

    /// Health classification at time `now`: seen within the last five
    /// minutes, and either still inside the new-peer grace window or
    /// above the minimum success ratio.
    pub fn is_healthy(&self, now: f64) -> bool {
        let age = now - self.last_seen;
        let total = self.success_count + self.failure_count;
        age < HEALTHY_MAX_AGE_SECS
            && (total < HEALTHY_GRACE_ATTEMPTS || self.success_rate() > HEALTHY_MIN_RATE)
    }
}

/// On-disk form of one peer, matching the external snapshot format.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedPeer {
    host: String,
    port: u16,
    last_seen: f64,
    success_count: u64,
    failure_count: u64,
}

/// In-memory table of known peers, keyed by `host:port`.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<String, PeerRecord>,
}

impl PeerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Merge a record into the table by address.
    ///
    /// `last_seen` takes the max and the monotone counters never
    /// regress, so stale incoming data can never roll a record back.
    pub fn upsert(&mut self, record: PeerRecord) {
        let key = record.address();
        match self.peers.get_mut(&key) {
            Some(existing) => {
                let incoming_newer = record.last_seen > existing.last_seen;
                existing.last_seen = existing.last_seen.max(record.last_seen);
                existing.success_count = existing.success_count.max(record.success_count);
                existing.failure_count = existing.failure_count.max(record.failure_count);
                if incoming_newer {
                    if record.node_id.is_some() {
                        existing.node_id = record.node_id;
                    }
                    if record.latency_ms.is_some() {
                        existing.latency_ms = record.latency_ms;
                    }
                } else if existing.node_id.is_none() {
                    existing.node_id = record.node_id;
                }
            }
            None => {
                debug!("New peer record: {key}");
                self.peers.insert(key, record);
            }
        }
    }

    /// Get a snapshot of one record by `host:port`.
    pub fn get(&self, address: &str) -> Option<PeerRecord> {
        self.peers.get(address).cloned()
    }

    /// Snapshot of every known peer.
    pub fn all(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    /// Snapshot of the peers currently classified healthy.
    pub fn healthy(&self, now: f64) -> Vec<PeerRecord> {
        self.peers
            .values()
            .filter(|p| p.is_healthy(now))
            .cloned()
            .collect()
    }

    /// Number of currently-healthy peers.
    pub fn healthy_count(&self, now: f64) -> usize {
        self.peers.values().filter(|p| p.is_healthy(now)).count()
    }

    /// Total number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Remove a record outright.
    pub fn remove(&mut self, address: &str) -> Option<PeerRecord> {
        self.peers.remove(address)
    }

    /// Record a successful contact: bump the success counter and
    /// refresh `last_seen` and latency. No-op for unknown peers.
    pub fn record_success(&mut self, address: &str, latency_ms: f64) {
        if let Some(peer) = self.peers.get_mut(address) {
            peer.success_count += 1;
            peer.last_seen = now_ts();
            peer.latency_ms = Some(latency_ms);
        }
    }

    /// Record a failed contact. No-op for unknown peers.
    pub fn record_failure(&mut self, address: &str) {
        if let Some(peer) = self.peers.get_mut(address) {
            peer.failure_count += 1;
        }
    }

    /// Note a peer's reported node ID after a successful exchange.
    pub fn set_node_id(&mut self, address: &str, node_id: &str) {
        if let Some(peer) = self.peers.get_mut(address) {
            peer.node_id = Some(node_id.to_string());
        }
    }

    /// Remove every peer unseen for longer than `max_age_secs` and
    /// return the pruned addresses. Staleness is the only criterion.
    pub fn prune(&mut self, max_age_secs: f64) -> Vec<String> {
        let cutoff = now_ts() - max_age_secs;
        let dead: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen < cutoff)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &dead {
            self.peers.remove(key);
            info!("Pruned stale peer {key}");
        }
        dead
    }

    /// Save the table to a JSON snapshot file, keyed by `host:port`.
    /// Peers unseen for more than 24 hours are not persisted.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let cutoff = now_ts() - PERSIST_MAX_AGE_SECS;
        let snapshot: HashMap<&String, PersistedPeer> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen > cutoff)
            .map(|(k, p)| {
                (
                    k,
                    PersistedPeer {
                        host: p.host.clone(),
                        port: p.port,
                        last_seen: p.last_seen,
                        success_count: p.success_count,
                        failure_count: p.failure_count,
                    },
                )
            })
            .collect();

        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)?;
        info!("Saved {} peers to {}", snapshot.len(), path.display());
        Ok(())
    }

    /// Load a store from a snapshot file. A missing or corrupt file
    /// yields an empty store with a warning; this is never fatal.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("No saved peers found, starting fresh");
            return Self::new();
        }

        match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<HashMap<String, PersistedPeer>>(&data) {
                Ok(snapshot) => {
                    let mut store = Self::new();
                    for persisted in snapshot.into_values() {
                        let mut record = PeerRecord::new(persisted.host, persisted.port);
                        record.last_seen = persisted.last_seen;
                        record.success_count = persisted.success_count;
                        record.failure_count = persisted.failure_count;
                        store.peers.insert(record.address(), record);
                    }
                    info!("Loaded {} peers from {}", store.len(), path.display());
                    store
                }
                Err(e) => {
                    warn!("Corrupt peer snapshot, starting fresh: {e}");
                    Self::new()
                }
            },
            Err(e) => {
                warn!("Cannot read peer snapshot, starting fresh: {e}");
                Self::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
