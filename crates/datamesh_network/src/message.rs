//! Wire protocol — JSON-tagged request/response messages.
//!
//! Every frame on the wire is a single [`Message`] serialized as a JSON
//! object with a `"type"` discriminator, e.g. a peer-list request is
//! exactly `{"type":"peer_list_request"}`. Requests that expect the
//! receiver to learn about the caller carry a [`NodeEntry`] with the
//! caller's node ID and dialable address.

use serde::{Deserialize, Serialize};

/// A node reference carried inside DHT messages: the node's ID (hex)
/// and its dialable `host:port` address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_id: String,
    pub address: String,
}

/// One entry of a peer-list exchange response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerListEntry {
    /// `host:port` of the peer.
    pub address: String,
    /// Node ID reported by the peer, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Unix timestamp (seconds) the sender last heard from this peer.
    pub last_seen: f64,
}

/// All messages understood by a datamesh node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // ── Liveness ────────────────────────────────────────────────────
    /// Liveness probe; also introduces the sender.
    Ping { sender: NodeEntry },
    /// Probe response.
    Pong { node_id: String },

    // ── Kademlia RPCs ───────────────────────────────────────────────
    /// Ask for the k nodes closest to `target` (hex node ID).
    FindNode { sender: NodeEntry, target: String },
    /// Closest-node reply.
    Nodes { nodes: Vec<NodeEntry> },
    /// Ask for the value stored under `key`, or the closest nodes.
    FindValue { sender: NodeEntry, key: String },
    /// Value reply.
    Value { key: String, value: Vec<u8> },
    /// The key is not stored at the queried node.
    NotFound { key: String },
    /// Store a value under `key` at the receiver.
    Store {
        sender: NodeEntry,
        key: String,
        value: Vec<u8>,
    },
    /// Store acknowledgement.
    StoreAck { key: String },

    // ── Peer exchange ───────────────────────────────────────────────
    /// Request a bounded snapshot of the receiver's healthy peers.
    PeerListRequest,
    /// Bounded healthy-peer snapshot.
    PeerListResponse { peers: Vec<PeerListEntry> },
}

impl Message {
    /// Serialize the message to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
