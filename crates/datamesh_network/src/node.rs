//! MeshNode — top-level coordinator for the distribution layer.
//!
//! [`MeshNode`] is the primary public API of datamesh_network. It owns:
//! - the transport serving loop (inbound DHT RPCs and peer-list requests)
//! - the DHT engine (replication and lookup)
//! - the peer store (loaded at start, flushed at stop)
//! - the three background tasks: health monitor, peer exchange and
//!   bootstrap manager
//!
//! External collaborators hand the node opaque byte payloads keyed by a
//! content hash; the node never interprets, encrypts or authorizes them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapManager;
use crate::config::NetworkConfig;
use crate::dht::DhtEngine;
use crate::error::NetworkError;
use crate::exchange::{PeerExchange, shareable_peers};
use crate::identity::NodeId;
use crate::message::Message;
use crate::monitor::HealthMonitor;
use crate::store::{PeerRecord, PeerStore, now_ts, parse_address};
use crate::transport::{self, RpcHandler, TrafficCounters};

/// On-demand aggregate over the peer store and transport counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    pub total_peers: usize,
    pub healthy_peers: usize,
    pub routing_table_size: usize,
    pub bootstrap_seeds: usize,
    pub avg_latency_ms: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_secs: u64,
}

/// The top-level datamesh network node.
///
/// Create one per process, call [`start()`](MeshNode::start) to begin
/// serving and join the network, and [`stop()`](MeshNode::stop) for a
/// coordinated shutdown (all loops stopped, listener closed, store
/// flushed).
pub struct MeshNode {
    config: NetworkConfig,
    node_id: NodeId,
    store: Arc<RwLock<PeerStore>>,
    counters: Arc<TrafficCounters>,
    engine: Option<Arc<DhtEngine>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    started_at: Option<Instant>,
    running: bool,
}

impl MeshNode {
    /// Create a new node with the given configuration.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            node_id: NodeId::generate(),
            store: Arc::new(RwLock::new(PeerStore::new())),
            counters: Arc::new(TrafficCounters::new()),
            engine: None,
            shutdown_tx: None,
            tasks: Vec::new(),
            local_addr: None,
            started_at: None,
            running: false,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The actually-bound listen address (available once started).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn engine(&self) -> Result<&Arc<DhtEngine>, NetworkError> {
        if !self.running {
            return Err(NetworkError::NotRunning);
        }
        self.engine.as_ref().ok_or(NetworkError::NotRunning)
    }

    /// Start the node: load the peer snapshot, bind the listener,
    /// bootstrap, and spawn the background loops.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.running {
            return Ok(());
        }

        std::fs::create_dir_all(&self.config.data_dir)?;
        *self.store.write().await = PeerStore::load_or_default(&self.config.peers_file());

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let engine = Arc::new(DhtEngine::new(
            self.node_id,
            local_addr.to_string(),
            &self.config,
            Arc::clone(&self.counters),
        ));
        self.engine = Some(Arc::clone(&engine));

        let (shutdown_tx, _) = broadcast::channel(8);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Inbound serving loop.
        let handler = Self::build_handler(
            Arc::clone(&self.store),
            Arc::clone(&engine),
            self.config.peer_exchange_cap,
        );
        let serve_counters = Arc::clone(&self.counters);
        let serve_shutdown = shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            transport::serve(listener, handler, serve_counters, serve_shutdown).await;
        }));

        self.running = true;
        self.started_at = Some(Instant::now());
        info!("Mesh node {} listening on {local_addr}", self.node_id);

        // Initial join, then the re-bootstrap loop. Total failure here
        // is non-fatal: the node stays up and can be joined inbound.
        let manager = BootstrapManager::new(
            Arc::clone(&self.store),
            Arc::clone(&engine),
            self.config.clone(),
        );
        manager.attempt_join().await;
        let bootstrap_shutdown = shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            manager.run(bootstrap_shutdown).await;
        }));

        let monitor = HealthMonitor::new(
            Arc::clone(&self.store),
            Arc::clone(&engine),
            self.config.clone(),
        );
        let monitor_shutdown = shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            monitor.run(monitor_shutdown).await;
        }));

        let exchange = PeerExchange::new(
            Arc::clone(&self.store),
            Arc::clone(&self.counters),
            local_addr.to_string(),
            self.config.clone(),
        );
        let exchange_shutdown = shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            exchange.run(exchange_shutdown).await;
        }));

        Ok(())
    }

    /// Coordinated shutdown: stop every loop, close the listener, and
    /// flush the peer store. Returns after all tasks have finished.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        for handle in self.tasks.drain(..) {
            let _ = handle.await;
        }

        let store = self.store.read().await;
        if let Err(e) = store.save_to_file(&self.config.peers_file()) {
            warn!("Failed to save peer snapshot: {e}");
        }

        self.engine = None;
        self.running = false;
        info!("Mesh node {} stopped", self.node_id);
    }

    /// The inbound RPC handler: peer-list requests are answered with a
    /// bounded healthy snapshot, everything else goes to the engine.
    /// Inbound pings also create/refresh a peer record for the caller.
    fn build_handler(
        store: Arc<RwLock<PeerStore>>,
        engine: Arc<DhtEngine>,
        exchange_cap: usize,
    ) -> RpcHandler {
        Arc::new(move |msg, src| {
            let store = Arc::clone(&store);
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                match msg {
                    Message::PeerListRequest => {
                        let guard = store.read().await;
                        let peers = shareable_peers(&guard, exchange_cap, now_ts());
                        Some(Message::PeerListResponse { peers })
                    }
                    Message::Ping { ref sender } => {
                        if let Ok((host, port)) = parse_address(&sender.address) {
                            let mut record = PeerRecord::new(host, port);
                            record.node_id = Some(sender.node_id.clone());
                            record.last_seen = now_ts();
                            record.success_count = 1;
                            store.write().await.upsert(record);
                        } else {
                            debug!("Ping from {src} with undialable address");
                        }
                        engine.handle(msg).await
                    }
                    other => engine.handle(other).await,
                }
            })
        })
    }

    // -----------------------------------------------------------------------
    // Data operations
    // -----------------------------------------------------------------------

    /// Store a payload under its content hash: local cache, DHT
    /// replication, then a direct best-effort broadcast to every
    /// healthy peer. Individual peer failures only bump that peer's
    /// failure counter.
    pub async fn send_data(&self, hash: &str, payload: &[u8]) -> Result<(), NetworkError> {
        let engine = self.engine()?;
        engine.store_local(hash, payload.to_vec()).await;

        match engine.put(hash, payload).await {
            Ok(n) => debug!("DHT stored {hash} on {n} node(s)"),
            Err(e) => warn!("DHT replication of {hash} degraded: {e}"),
        }

        self.broadcast_to_healthy(hash, payload).await;
        info!("Data stored: {hash}");
        Ok(())
    }

    /// Re-propagate a payload without touching the local cache.
    pub async fn broadcast_data(&self, hash: &str, payload: &[u8]) -> Result<(), NetworkError> {
        let engine = self.engine()?;
        match engine.put(hash, payload).await {
            Ok(n) => debug!("DHT stored {hash} on {n} node(s)"),
            Err(e) => warn!("DHT replication of {hash} degraded: {e}"),
        }
        self.broadcast_to_healthy(hash, payload).await;
        Ok(())
    }

    /// Retrieve a payload: local cache first, then the DHT. `None`
    /// means not found anywhere reachable.
    pub async fn get_data(&self, hash: &str) -> Result<Option<Vec<u8>>, NetworkError> {
        let engine = self.engine()?;
        Ok(engine.get(hash).await)
    }

    /// Fire a Store at every currently-healthy peer, recording the
    /// per-peer outcome in the store.
    async fn broadcast_to_healthy(&self, hash: &str, payload: &[u8]) {
        let Ok(engine) = self.engine() else {
            return;
        };

        let healthy: Vec<String> = {
            let store = self.store.read().await;
            store
                .healthy(now_ts())
                .into_iter()
                .map(|p| p.address())
                .collect()
        };

        let sends = healthy.iter().map(|addr| {
            let msg = Message::Store {
                sender: engine.sender_entry(),
                key: hash.to_string(),
                value: payload.to_vec(),
            };
            async move {
                let started = Instant::now();
                let result =
                    transport::request(addr, &msg, self.config.rpc_timeout, &self.counters).await;
                (addr, started.elapsed(), result)
            }
        });

        for (addr, elapsed, result) in futures::future::join_all(sends).await {
            let mut store = self.store.write().await;
            match result {
                Ok(Message::StoreAck { .. }) => {
                    store.record_success(addr, elapsed.as_secs_f64() * 1000.0);
                }
                Ok(other) => {
                    debug!("Unexpected broadcast reply from {addr}: {other:?}");
                    store.record_failure(addr);
                }
                Err(e) => {
                    debug!("Broadcast to {addr} failed: {e}");
                    store.record_failure(addr);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Peer management
    // -----------------------------------------------------------------------

    /// Attempt direct contact with a peer. `Ok(true)` on success (and
    /// the peer is recorded), `Ok(false)` for an unreachable peer; the
    /// only error is a malformed address.
    pub async fn connect_to_peer(&self, addr: &str) -> Result<bool, NetworkError> {
        let engine = self.engine()?;
        let (host, port) = parse_address(addr)?;
        let dial = format!("{host}:{port}");

        match engine.ping(&dial).await {
            Ok(node_id) => {
                let mut record = PeerRecord::new(host, port);
                record.node_id = Some(node_id.to_hex());
                record.last_seen = now_ts();
                record.success_count = 1;
                self.store.write().await.upsert(record);
                info!("Connected to peer {dial}");
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to connect to {dial}: {e}");
                Ok(false)
            }
        }
    }

    /// Snapshot of all known peers, most recently seen first.
    pub async fn connected_peers(&self) -> Vec<PeerRecord> {
        let mut peers = self.store.read().await.all();
        peers.sort_by(|a, b| {
            b.last_seen
                .partial_cmp(&a.last_seen)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        peers
    }

    /// Snapshot of the currently-healthy peers.
    pub async fn healthy_peers(&self) -> Vec<PeerRecord> {
        self.store.read().await.healthy(now_ts())
    }

    /// Aggregate network statistics, computed on demand.
    pub async fn network_stats(&self) -> NetworkStats {
        let store = self.store.read().await;
        let now = now_ts();
        let healthy = store.healthy(now);

        let latencies: Vec<f64> = healthy.iter().filter_map(|p| p.latency_ms).collect();
        let avg_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let routing_table_size = match &self.engine {
            Some(engine) => engine.routing_len().await,
            None => 0,
        };

        NetworkStats {
            total_peers: store.len(),
            healthy_peers: healthy.len(),
            routing_table_size,
            bootstrap_seeds: self.config.bootstrap_peers.len(),
            avg_latency_ms,
            bytes_sent: self.counters.bytes_sent(),
            bytes_received: self.counters.bytes_received(),
            uptime_secs: self
                .started_at
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(name: &str) -> NetworkConfig {
        let dir = std::env::temp_dir().join(format!("datamesh_test_node_{name}"));
        let _ = std::fs::remove_dir_all(&dir);

        let mut config = NetworkConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.data_dir = dir;
        config.rpc_timeout = Duration::from_secs(2);
        config
    }

    async fn started_node(name: &str) -> MeshNode {
        let mut node = MeshNode::new(test_config(name));
        node.start().await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let mut node = started_node("lifecycle").await;
        assert!(node.is_running());
        assert!(node.local_addr().is_some());

        node.stop().await;
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_noop() {
        let mut node = started_node("double_start").await;
        node.start().await.unwrap();
        assert!(node.is_running());
        node.stop().await;
    }

    #[tokio::test]
    async fn test_operations_require_running_node() {
        let node = MeshNode::new(test_config("not_running"));

        assert!(matches!(
            node.send_data("h", b"v").await,
            Err(NetworkError::NotRunning)
        ));
        assert!(matches!(
            node.get_data("h").await,
            Err(NetworkError::NotRunning)
        ));
        assert!(matches!(
            node.connect_to_peer("127.0.0.1:1").await,
            Err(NetworkError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_address() {
        let mut node = started_node("bad_addr").await;
        assert!(matches!(
            node.connect_to_peer("definitely not an address").await,
            Err(NetworkError::InvalidAddress(_))
        ));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_peer_returns_false() {
        let mut node = started_node("unreachable").await;
        assert!(!node.connect_to_peer("127.0.0.1:1").await.unwrap());
        node.stop().await;
    }

    #[tokio::test]
    async fn test_send_get_roundtrip_with_zero_peers() {
        let mut node = started_node("solo_roundtrip").await;

        node.send_data("deadbeef", b"ciphertext").await.unwrap();
        let fetched = node.get_data("deadbeef").await.unwrap();
        assert_eq!(fetched, Some(b"ciphertext".to_vec()));

        assert_eq!(node.get_data("unknown").await.unwrap(), None);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_two_node_connect_and_replicate() {
        let mut node_a = started_node("pair_a").await;
        let mut node_b = started_node("pair_b").await;
        let addr_a = node_a.local_addr().unwrap().to_string();

        // B dials A; both sides should now know each other.
        assert!(node_b.connect_to_peer(&addr_a).await.unwrap());
        assert_eq!(node_b.connected_peers().await.len(), 1);
        assert!(!node_a.connected_peers().await.is_empty());

        // Data sent from B lands on A (DHT put and/or direct broadcast),
        // so A can serve it from its local records.
        node_b.send_data("cafebabe", b"payload").await.unwrap();
        let fetched = node_a.get_data("cafebabe").await.unwrap();
        assert_eq!(fetched, Some(b"payload".to_vec()));

        let stats = node_b.network_stats().await;
        assert_eq!(stats.total_peers, 1);
        assert_eq!(stats.healthy_peers, 1);
        assert!(stats.bytes_sent > 0);

        node_a.stop().await;
        node_b.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_peer_list_request_is_bounded_and_healthy_only() {
        let mut node = started_node("peer_list").await;

        {
            let mut store = node.store.write().await;
            let mut healthy = PeerRecord::new("10.0.0.1", 8468);
            healthy.last_seen = now_ts() - 5.0;
            healthy.success_count = 3;
            store.upsert(healthy);

            let mut stale = PeerRecord::new("10.0.0.2", 8468);
            stale.last_seen = now_ts() - 900.0;
            store.upsert(stale);
        }

        let counters = TrafficCounters::new();
        let reply = transport::request(
            &node.local_addr().unwrap().to_string(),
            &Message::PeerListRequest,
            Duration::from_secs(2),
            &counters,
        )
        .await
        .unwrap();

        match reply {
            Message::PeerListResponse { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].address, "10.0.0.1:8468");
            }
            other => panic!("Expected PeerListResponse, got {other:?}"),
        }

        node.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_node_ignores_open_connections() {
        use crate::message::NodeEntry;
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let mut node = started_node("open_conn").await;
        let url = format!("ws://{}", node.local_addr().unwrap());
        let (ws, _) = connect_async(&url).await.unwrap();
        let (mut sink, mut stream) = ws.split();

        let ping = Message::Ping {
            sender: NodeEntry {
                node_id: "ab".repeat(32),
                address: "127.0.0.1:1".to_string(),
            },
        }
        .to_json()
        .unwrap();

        // The live node answers on the connection.
        sink.send(WsMessage::Text(ping.clone().into()))
            .await
            .unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Ok(WsMessage::Text(_)))
        ));

        node.stop().await;

        // After stop() returns, the same connection is dead: no Pong,
        // and no late upsert into the flushed store.
        let _ = sink.send(WsMessage::Text(ping.into())).await;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(_))) => {
                    panic!("stopped node answered on an open connection")
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }
    }

    #[tokio::test]
    async fn test_stop_flushes_peer_snapshot() {
        let mut node = started_node("flush").await;
        let peers_file = node.config.peers_file();

        {
            let mut store = node.store.write().await;
            let mut record = PeerRecord::new("10.0.0.1", 8468);
            record.last_seen = now_ts() - 5.0;
            record.success_count = 7;
            store.upsert(record);
        }

        node.stop().await;

        let reloaded = PeerStore::load_or_default(&peers_file);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("10.0.0.1:8468").unwrap().success_count, 7);
    }

    #[tokio::test]
    async fn test_stats_on_idle_node() {
        let mut node = started_node("stats").await;
        let stats = node.network_stats().await;
        assert_eq!(stats.total_peers, 0);
        assert_eq!(stats.healthy_peers, 0);
        assert_eq!(stats.routing_table_size, 0);
        assert_eq!(stats.avg_latency_ms, 0.0);
        node.stop().await;
    }
}
