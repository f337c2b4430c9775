//! Peer exchange — gossiping bounded healthy-peer snapshots.
//!
//! Every cycle asks each currently-healthy peer for its peer list and
//! merges the response into the store. Responses served to others only
//! ever contain healthy peers, capped, so the full table (and its
//! stale entries) never leaks. Merging goes through `upsert`, which
//! keeps the locally more-recent record.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::config::NetworkConfig;
use crate::message::{Message, PeerListEntry};
use crate::store::{PeerRecord, PeerStore, now_ts, parse_address};
use crate::transport::{self, TrafficCounters};

/// Build the bounded healthy-peer snapshot served to other nodes.
pub fn shareable_peers(store: &PeerStore, cap: usize, now: f64) -> Vec<PeerListEntry> {
    store
        .healthy(now)
        .into_iter()
        .take(cap)
        .map(|p| PeerListEntry {
            address: p.address(),
            node_id: p.node_id,
            last_seen: p.last_seen,
        })
        .collect()
}

pub struct PeerExchange {
    store: Arc<RwLock<PeerStore>>,
    counters: Arc<TrafficCounters>,
    /// Our own dialable address, excluded from merges.
    local_addr: String,
    config: NetworkConfig,
}

impl PeerExchange {
    pub fn new(
        store: Arc<RwLock<PeerStore>>,
        counters: Arc<TrafficCounters>,
        local_addr: impl Into<String>,
        config: NetworkConfig,
    ) -> Self {
        Self {
            store,
            counters,
            local_addr: local_addr.into(),
            config,
        }
    }

    /// Run the exchange loop until shutdown.
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.peer_exchange_interval) => {
                    self.cycle().await;
                }
                _ = shutdown.recv() => {
                    debug!("Peer exchange shutting down");
                    break;
                }
            }
        }
    }

    /// One exchange cycle over the currently-healthy peers.
    async fn cycle(&self) {
        let healthy: Vec<String> = {
            let store = self.store.read().await;
            store
                .healthy(now_ts())
                .into_iter()
                .map(|p| p.address())
                .collect()
        };

        for addr in healthy {
            let started = Instant::now();
            match transport::request(
                &addr,
                &Message::PeerListRequest,
                self.config.rpc_timeout,
                &self.counters,
            )
            .await
            {
                Ok(Message::PeerListResponse { peers }) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    trace!("Received {} peer(s) from {addr}", peers.len());
                    let mut store = self.store.write().await;
                    store.record_success(&addr, latency_ms);
                    merge_peer_list(&mut store, peers, &self.local_addr, self.config.peer_exchange_cap);
                }
                Ok(other) => {
                    debug!("Unexpected peer-list reply from {addr}: {other:?}");
                    self.store.write().await.record_failure(&addr);
                }
                Err(e) => {
                    debug!("Peer exchange with {addr} failed: {e}");
                    self.store.write().await.record_failure(&addr);
                }
            }
        }
    }
}

/// Merge an incoming peer list into the store, bounded by `cap`.
/// Malformed addresses and our own address are skipped; timestamps from
/// the future are clamped so a peer's clock skew cannot fabricate
/// freshness.
pub fn merge_peer_list(
    store: &mut PeerStore,
    peers: Vec<PeerListEntry>,
    local_addr: &str,
    cap: usize,
) {
    let now = now_ts();
    for entry in peers.into_iter().take(cap) {
        if entry.address == local_addr {
            continue;
        }
        let Ok((host, port)) = parse_address(&entry.address) else {
            trace!("Skipping malformed exchanged address {}", entry.address);
            continue;
        };

        let mut record = PeerRecord::new(host, port);
        record.node_id = entry.node_id;
        record.last_seen = entry.last_seen.min(now);
        store.upsert(record);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
