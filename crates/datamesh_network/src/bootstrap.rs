//! Bootstrap manager — initial join and low-peer re-bootstrap.
//!
//! Joins the network at startup through the configured seeds plus any
//! healthy peers remembered from the last run. Total join failure is
//! non-fatal: the node keeps listening and can still be joined by
//! inbound peers. A periodic check re-attempts the join (at most once
//! per check interval) whenever the healthy-peer count falls below the
//! configured floor.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::dht::DhtEngine;
use crate::store::{PeerRecord, PeerStore, now_ts, parse_address};

pub struct BootstrapManager {
    store: Arc<RwLock<PeerStore>>,
    engine: Arc<DhtEngine>,
    config: NetworkConfig,
}

impl BootstrapManager {
    pub fn new(
        store: Arc<RwLock<PeerStore>>,
        engine: Arc<DhtEngine>,
        config: NetworkConfig,
    ) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    /// Candidate join addresses: the configured seeds (normalized to
    /// `host:port`) plus previously-known healthy peers, deduplicated.
    async fn seed_addresses(&self) -> Vec<String> {
        let mut seeds = Vec::new();

        for configured in &self.config.bootstrap_peers {
            match parse_address(configured) {
                Ok((host, port)) => {
                    let addr = format!("{host}:{port}");
                    if !seeds.contains(&addr) {
                        seeds.push(addr);
                    }
                }
                Err(e) => warn!("Ignoring bootstrap seed: {e}"),
            }
        }

        let store = self.store.read().await;
        for peer in store.healthy(now_ts()) {
            let addr = peer.address();
            if !seeds.contains(&addr) {
                seeds.push(addr);
            }
        }

        seeds
    }

    /// Attempt a join and fold responders plus every routing-table
    /// contact the join discovered into the peer store. Returns the
    /// number of seeds that responded.
    pub async fn attempt_join(&self) -> usize {
        let seeds = self.seed_addresses().await;
        if seeds.is_empty() {
            warn!("No bootstrap nodes available");
            return 0;
        }

        info!("Bootstrapping to {} node(s)", seeds.len());
        match self.engine.join(&seeds).await {
            Ok(responders) => {
                let count = responders.len();
                let mut store = self.store.write().await;
                for (addr, node_id) in responders {
                    if let Ok((host, port)) = parse_address(&addr) {
                        let mut record = PeerRecord::new(host, port);
                        record.node_id = Some(node_id.to_hex());
                        record.last_seen = now_ts();
                        record.success_count = 1;
                        store.upsert(record);
                    }
                }

                // Nodes learned during the self-lookup become peer
                // records too, so they get persisted, gossiped and
                // health-monitored rather than living only in the
                // routing table.
                for contact in self.engine.contacts().await {
                    if let Ok((host, port)) = parse_address(&contact.address) {
                        let mut record = PeerRecord::new(host, port);
                        record.node_id = Some(contact.id.to_hex());
                        record.last_seen = now_ts();
                        store.upsert(record);
                    }
                }

                info!("Bootstrap complete, {} peer(s) known", store.len());
                count
            }
            Err(e) => {
                warn!("Bootstrap failed: {e}");
                0
            }
        }
    }

    /// Run the re-bootstrap loop until shutdown.
    ///
    /// At most one join attempt happens per check interval, so a
    /// persistently small network never causes a join storm.
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.rebootstrap_interval) => {
                    let healthy = self.store.read().await.healthy_count(now_ts());
                    if healthy >= self.config.min_peers {
                        continue;
                    }

                    info!(
                        "Only {healthy} healthy peer(s) (floor {}), re-bootstrapping after grace",
                        self.config.min_peers
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.rebootstrap_grace) => {
                            self.attempt_join().await;
                        }
                        _ = shutdown.recv() => {
                            debug!("Bootstrap manager shutting down");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Bootstrap manager shutting down");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
