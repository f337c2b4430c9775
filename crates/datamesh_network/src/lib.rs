//! Datamesh Network — P2P distribution layer for content-addressed data.
//!
//! This crate provides the peer-to-peer networking layer for a datamesh
//! node: a Kademlia-style DHT for replicated key/value storage, plus the
//! peer lifecycle machinery around it (persistent peer records, health
//! monitoring, peer exchange and bootstrap).
//!
//! # Architecture
//!
//! - **Transport**: one-shot WebSocket RPCs (via `tokio-tungstenite`) —
//!   connect, send one JSON frame, await one reply, close.
//! - **DHT**: 256-bit XOR keyspace, k-bucket routing table, iterative
//!   alpha-parallel lookups.
//! - **Peer lifecycle**: success/failure counters drive a health
//!   classification; healthy peers are gossiped, dead ones pruned, and
//!   the known-peer table survives restarts on disk.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use datamesh_network::{MeshNode, NetworkConfig};
//!
//! # async fn example() {
//! let mut node = MeshNode::new(NetworkConfig::default());
//! node.start().await.unwrap();
//!
//! node.send_data("deadbeef", b"opaque payload").await.unwrap();
//! let data = node.get_data("deadbeef").await.unwrap();
//! assert!(data.is_some());
//!
//! node.stop().await;
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod dht;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod message;
pub mod monitor;
pub mod node;
pub mod routing;
pub mod store;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use dht::DhtEngine;
pub use error::NetworkError;
pub use identity::NodeId;
pub use message::Message;
pub use node::{MeshNode, NetworkStats};
pub use store::{PeerRecord, PeerStore};
