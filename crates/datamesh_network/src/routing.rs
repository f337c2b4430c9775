//! Kademlia routing table — 256 XOR-distance k-buckets.

use crate::identity::NodeId;
use crate::message::NodeEntry;

/// A routable contact: node ID plus dialable address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    pub address: String,
}

impl Contact {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    /// Wire representation of this contact.
    pub fn to_entry(&self) -> NodeEntry {
        NodeEntry {
            node_id: self.id.to_hex(),
            address: self.address.clone(),
        }
    }

    /// Parse a wire entry; `None` if the node ID is malformed.
    pub fn from_entry(entry: &NodeEntry) -> Option<Self> {
        Some(Self {
            id: NodeId::from_hex(&entry.node_id)?,
            address: entry.address.clone(),
        })
    }
}

/// Fixed-depth routing table: one bucket per distance prefix, each
/// holding at most `k` contacts ordered oldest-first.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Vec<Contact>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k,
            buckets: vec![Vec::new(); 256],
        }
    }

    /// Insert or refresh a contact. A re-seen contact moves to the tail
    /// of its bucket (most recently seen); when a bucket is full the
    /// oldest contact is evicted to make room.
    pub fn insert(&mut self, contact: Contact) {
        let Some(index) = self.local_id.bucket_index(&contact.id) else {
            return; // Never route to ourselves.
        };

        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.iter().position(|c| c.id == contact.id) {
            bucket.remove(pos);
            bucket.push(contact);
            return;
        }

        if bucket.len() >= self.k {
            bucket.remove(0);
        }
        bucket.push(contact);
    }

    /// Remove a contact by node ID.
    pub fn remove(&mut self, id: &NodeId) {
        if let Some(index) = self.local_id.bucket_index(id) {
            self.buckets[index].retain(|c| c.id != *id);
        }
    }

    /// The `count` contacts closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.buckets.iter().flatten().cloned().collect();
        contacts.sort_by_key(|c| c.id.distance(target));
        contacts.truncate(count);
        contacts
    }

    /// Every contact in the table.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets.iter().flatten().cloned().collect()
    }

    /// Total number of contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
