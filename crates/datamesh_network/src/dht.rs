//! DHT engine — Kademlia-style storage and lookup over the transport.
//!
//! The engine owns the routing table and the local record map, serves
//! the Kademlia RPCs (ping, find-node, find-value, store) and runs the
//! iterative lookup that drives `join`, `put` and `get`. Everything
//! network-facing is bounded by the configured RPC timeout; individual
//! peer failures are skipped, never propagated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::identity::NodeId;
use crate::message::{Message, NodeEntry};
use crate::routing::{Contact, RoutingTable};
use crate::transport::{self, TrafficCounters};

/// Cap on iterative-lookup rounds, to terminate even on a pathological
/// routing view.
const MAX_LOOKUP_ITERATIONS: usize = 20;

/// The Kademlia engine behind the node façade.
pub struct DhtEngine {
    local_id: NodeId,
    /// Our dialable `host:port`, advertised inside outgoing RPCs.
    advertise_addr: String,
    k: usize,
    alpha: usize,
    rpc_timeout: Duration,
    routing: RwLock<RoutingTable>,
    records: RwLock<HashMap<String, Vec<u8>>>,
    counters: Arc<TrafficCounters>,
}

impl DhtEngine {
    pub fn new(
        local_id: NodeId,
        advertise_addr: impl Into<String>,
        config: &NetworkConfig,
        counters: Arc<TrafficCounters>,
    ) -> Self {
        Self {
            local_id,
            advertise_addr: advertise_addr.into(),
            k: config.replication_k,
            alpha: config.lookup_alpha,
            rpc_timeout: config.rpc_timeout,
            routing: RwLock::new(RoutingTable::new(local_id, config.replication_k)),
            records: RwLock::new(HashMap::new()),
            counters,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Wire identity carried in outgoing requests.
    pub fn sender_entry(&self) -> NodeEntry {
        NodeEntry {
            node_id: self.local_id.to_hex(),
            address: self.advertise_addr.clone(),
        }
    }

    /// Add a contact to the routing table.
    pub async fn observe(&self, contact: Contact) {
        self.routing.write().await.insert(contact);
    }

    /// Note the sender of an inbound RPC, if its ID parses.
    async fn observe_entry(&self, entry: &NodeEntry) {
        if let Some(contact) = Contact::from_entry(entry) {
            self.observe(contact).await;
        }
    }

    /// Number of contacts currently in the routing table.
    pub async fn routing_len(&self) -> usize {
        self.routing.read().await.len()
    }

    /// Snapshot of every contact in the routing table.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.routing.read().await.contacts()
    }

    /// Number of records held locally.
    pub async fn records_len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Write a record into the local map (the node's data cache).
    pub async fn store_local(&self, key: &str, value: Vec<u8>) {
        self.records.write().await.insert(key.to_string(), value);
    }

    /// Read a record from the local map only.
    pub async fn get_local(&self, key: &str) -> Option<Vec<u8>> {
        self.records.read().await.get(key).cloned()
    }

    // -----------------------------------------------------------------------
    // Inbound RPC serving
    // -----------------------------------------------------------------------

    /// Serve one inbound Kademlia RPC. Non-request messages yield no
    /// reply.
    pub async fn handle(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::Ping { sender } => {
                self.observe_entry(&sender).await;
                Some(Message::Pong {
                    node_id: self.local_id.to_hex(),
                })
            }
            Message::FindNode { sender, target } => {
                self.observe_entry(&sender).await;
                let Some(target_id) = NodeId::from_hex(&target) else {
                    warn!("find_node with malformed target from {}", sender.address);
                    return Some(Message::Nodes { nodes: vec![] });
                };
                let nodes = self
                    .routing
                    .read()
                    .await
                    .closest(&target_id, self.k)
                    .iter()
                    .map(Contact::to_entry)
                    .collect();
                Some(Message::Nodes { nodes })
            }
            Message::FindValue { sender, key } => {
                self.observe_entry(&sender).await;
                match self.get_local(&key).await {
                    Some(value) => Some(Message::Value { key, value }),
                    None => Some(Message::NotFound { key }),
                }
            }
            Message::Store { sender, key, value } => {
                self.observe_entry(&sender).await;
                debug!("Storing record {key} from {}", sender.address);
                self.store_local(&key, value).await;
                Some(Message::StoreAck { key })
            }
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Outbound operations
    // -----------------------------------------------------------------------

    /// Join the network through the given seed addresses.
    ///
    /// Pings every seed, inserts responders into the routing table and
    /// then runs a self-lookup to populate nearby buckets. Succeeds if
    /// at least one seed responded, returning the responders; repeated
    /// joins against an already-known seed are harmless.
    pub async fn join(&self, seeds: &[String]) -> Result<Vec<(String, NodeId)>, NetworkError> {
        let mut unique: Vec<&String> = Vec::new();
        for seed in seeds {
            if !unique.contains(&seed) {
                unique.push(seed);
            }
        }

        let mut reached = Vec::new();
        for seed in unique {
            match self.ping(seed).await {
                Ok(node_id) => {
                    info!("Bootstrap seed {seed} responded ({node_id})");
                    reached.push((seed.clone(), node_id));
                }
                Err(e) => {
                    warn!("Bootstrap seed {seed} unreachable: {e}");
                }
            }
        }

        if reached.is_empty() {
            return Err(NetworkError::NoSeedReachable);
        }

        // Populate buckets around our own ID, keeping every node the
        // lookup discovered so callers can fold them into peer state.
        for contact in self.lookup(self.local_id).await {
            self.observe(contact).await;
        }
        Ok(reached)
    }

    /// Ping a single address; on success insert the responder into the
    /// routing table and return its node ID.
    pub async fn ping(&self, addr: &str) -> Result<NodeId, NetworkError> {
        let msg = Message::Ping {
            sender: self.sender_entry(),
        };
        let reply = transport::request(addr, &msg, self.rpc_timeout, &self.counters).await?;
        match reply {
            Message::Pong { node_id } => {
                let id = NodeId::from_hex(&node_id).ok_or_else(|| {
                    NetworkError::Transport(format!("Malformed node ID from {addr}"))
                })?;
                self.observe(Contact::new(id, addr)).await;
                Ok(id)
            }
            other => Err(NetworkError::Transport(format!(
                "Unexpected reply to ping from {addr}: {other:?}"
            ))),
        }
    }

    /// Iterative find-node: query alpha closest unqueried contacts per
    /// round, merging their replies into a distance-sorted shortlist,
    /// until no round learns a closer node.
    pub async fn lookup(&self, target: NodeId) -> Vec<Contact> {
        let mut shortlist = self.routing.read().await.closest(&target, self.k);
        let mut seen: HashSet<NodeId> = shortlist.iter().map(|c| c.id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut best = shortlist
            .first()
            .map(|c| c.id.distance(&target))
            .unwrap_or([0xff; 32]);

        for _ in 0..MAX_LOOKUP_ITERATIONS {
            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.id))
                .take(self.alpha)
                .cloned()
                .collect();

            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.id);
            }

            let queries = candidates.into_iter().map(|contact| async move {
                let msg = Message::FindNode {
                    sender: self.sender_entry(),
                    target: target.to_hex(),
                };
                let result =
                    transport::request(&contact.address, &msg, self.rpc_timeout, &self.counters)
                        .await;
                (contact, result)
            });

            let mut learned_closer = false;
            for (contact, result) in join_all(queries).await {
                match result {
                    Ok(Message::Nodes { nodes }) => {
                        self.observe(contact).await;
                        for entry in &nodes {
                            let Some(node) = Contact::from_entry(entry) else {
                                continue;
                            };
                            if node.id == self.local_id || !seen.insert(node.id) {
                                continue;
                            }
                            shortlist.push(node);
                        }
                    }
                    Ok(other) => {
                        debug!("Unexpected find_node reply: {other:?}");
                    }
                    Err(e) => {
                        debug!("find_node to {} failed: {e}", contact.address);
                    }
                }
            }

            shortlist.sort_by_key(|c| c.id.distance(&target));
            shortlist.truncate(self.k);

            if let Some(first) = shortlist.first() {
                let dist = first.id.distance(&target);
                if dist < best {
                    best = dist;
                    learned_closer = true;
                }
            }
            if !learned_closer {
                break;
            }
        }

        shortlist
    }

    /// Replicate a value to the nodes nearest its key.
    ///
    /// Returns the number of nodes that acknowledged the store. An
    /// empty routing table yields `Ok(0)` (single-node network); if
    /// candidates existed but none accepted, the put fails with
    /// [`NetworkError::Replication`].
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<usize, NetworkError> {
        let target = NodeId::for_key(key);
        let candidates = self.lookup(target).await;
        if candidates.is_empty() {
            debug!("No replication candidates for {key}");
            return Ok(0);
        }

        let stores = candidates.iter().take(self.k).map(|contact| async move {
            let msg = Message::Store {
                sender: self.sender_entry(),
                key: key.to_string(),
                value: value.to_vec(),
            };
            let result =
                transport::request(&contact.address, &msg, self.rpc_timeout, &self.counters).await;
            matches!(result, Ok(Message::StoreAck { .. }))
        });

        let stored = join_all(stores).await.iter().filter(|ok| **ok).count();
        if stored == 0 {
            return Err(NetworkError::Replication(format!(
                "No node accepted store for {key}"
            )));
        }

        debug!("Replicated {key} to {stored} node(s)");
        Ok(stored)
    }

    /// Fetch a value: local records first, then the closest nodes from
    /// an iterative lookup, first hit wins.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.get_local(key).await {
            return Some(value);
        }

        let target = NodeId::for_key(key);
        for contact in self.lookup(target).await {
            let msg = Message::FindValue {
                sender: self.sender_entry(),
                key: key.to_string(),
            };
            match transport::request(&contact.address, &msg, self.rpc_timeout, &self.counters).await
            {
                Ok(Message::Value { value, .. }) => return Some(value),
                Ok(_) => continue,
                Err(e) => {
                    debug!("find_value to {} failed: {e}", contact.address);
                    continue;
                }
            }
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RpcHandler;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    fn test_config() -> NetworkConfig {
        let mut config = NetworkConfig::default();
        config.rpc_timeout = Duration::from_secs(2);
        config
    }

    fn engine(addr: &str) -> Arc<DhtEngine> {
        Arc::new(DhtEngine::new(
            NodeId::generate(),
            addr,
            &test_config(),
            Arc::new(TrafficCounters::new()),
        ))
    }

    fn engine_handler(engine: Arc<DhtEngine>) -> RpcHandler {
        Arc::new(move |msg, _src| {
            let engine = Arc::clone(&engine);
            Box::pin(async move { engine.handle(msg).await })
        })
    }

    /// Bind a listener, serve the engine on it, return its address.
    async fn serve_engine(engine: Arc<DhtEngine>, shutdown_tx: &broadcast::Sender<()>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let counters = Arc::new(TrafficCounters::new());
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            transport::serve(listener, engine_handler(engine), counters, shutdown_rx).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_handle_ping_observes_sender() {
        let engine = engine("127.0.0.1:8468");
        let sender = Contact::new(NodeId::generate(), "10.0.0.1:8468");

        let reply = engine
            .handle(Message::Ping {
                sender: sender.to_entry(),
            })
            .await;

        assert!(matches!(reply, Some(Message::Pong { .. })));
        assert_eq!(engine.routing_len().await, 1);
    }

    #[tokio::test]
    async fn test_handle_store_then_find_value() {
        let engine = engine("127.0.0.1:8468");
        let sender = Contact::new(NodeId::generate(), "10.0.0.1:8468").to_entry();

        let ack = engine
            .handle(Message::Store {
                sender: sender.clone(),
                key: "abc123".to_string(),
                value: vec![1, 2, 3],
            })
            .await;
        assert!(matches!(ack, Some(Message::StoreAck { .. })));

        let hit = engine
            .handle(Message::FindValue {
                sender: sender.clone(),
                key: "abc123".to_string(),
            })
            .await;
        match hit {
            Some(Message::Value { value, .. }) => assert_eq!(value, vec![1, 2, 3]),
            other => panic!("Expected Value, got {other:?}"),
        }

        let miss = engine
            .handle(Message::FindValue {
                sender,
                key: "missing".to_string(),
            })
            .await;
        assert!(matches!(miss, Some(Message::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_handle_find_node_returns_known_contacts() {
        let engine = engine("127.0.0.1:8468");
        for i in 1..=5u8 {
            engine
                .observe(Contact::new(NodeId::generate(), format!("10.0.0.{i}:1")))
                .await;
        }

        let reply = engine
            .handle(Message::FindNode {
                sender: Contact::new(NodeId::generate(), "10.0.0.9:1").to_entry(),
                target: NodeId::generate().to_hex(),
            })
            .await;

        match reply {
            Some(Message::Nodes { nodes }) => assert_eq!(nodes.len(), 6), // 5 + the sender
            other => panic!("Expected Nodes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_put_with_empty_routing_table_is_ok_zero() {
        let engine = engine("127.0.0.1:8468");
        assert_eq!(engine.put("somehash", b"payload").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_fails_when_all_candidates_dead() {
        let engine = engine("127.0.0.1:8468");
        engine
            .observe(Contact::new(NodeId::generate(), "127.0.0.1:1"))
            .await;

        let result = engine.put("somehash", b"payload").await;
        assert!(matches!(result, Err(NetworkError::Replication(_))));
    }

    #[tokio::test]
    async fn test_join_fails_with_no_reachable_seed() {
        let engine = engine("127.0.0.1:8468");
        let result = engine.join(&["127.0.0.1:1".to_string()]).await;
        assert!(matches!(result, Err(NetworkError::NoSeedReachable)));
    }

    #[tokio::test]
    async fn test_two_engine_join_put_get() {
        let (shutdown_tx, _) = broadcast::channel(4);

        let engine_b = engine("placeholder");
        let addr_b = serve_engine(Arc::clone(&engine_b), &shutdown_tx).await;

        // Engine A joins through B, then replicates a record.
        let engine_a = engine("127.0.0.1:9");
        let joined = engine_a.join(&[addr_b.clone()]).await.unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].0, addr_b);
        assert_eq!(engine_a.routing_len().await, 1);

        let stored = engine_a.put("deadbeef", b"ciphertext").await.unwrap();
        assert_eq!(stored, 1);
        assert_eq!(
            engine_b.get_local("deadbeef").await,
            Some(b"ciphertext".to_vec())
        );

        // A third engine joining through B can fetch the record; its
        // self-lookup also discovered A through B.
        let engine_c = engine("127.0.0.1:9");
        engine_c.join(&[addr_b]).await.unwrap();
        assert_eq!(engine_c.routing_len().await, 2);
        let fetched = engine_c.get("deadbeef").await;
        assert_eq!(fetched, Some(b"ciphertext".to_vec()));

        let _ = shutdown_tx.send(());
    }
}
