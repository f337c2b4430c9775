//! Node identity — 256-bit identifiers and the XOR distance metric.

use std::fmt;

use sha2::{Digest, Sha256};

/// A 256-bit node identifier in the DHT keyspace.
///
/// Both nodes and stored records live in the same keyspace; records are
/// placed on the nodes whose IDs are nearest (by XOR distance) to the
/// record's key ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Generate a random node ID.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Derive the key ID for a content hash string.
    pub fn for_key(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        Self(digest.into())
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encode the ID.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parse a hex-encoded ID. Returns `None` for anything that is not
    /// exactly 64 hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(bytes))
    }

    /// XOR distance between two IDs.
    pub fn distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Index of the k-bucket a peer at the given distance belongs in:
    /// 255 minus the number of leading zero bits of the distance.
    /// Returns `None` when the distance is zero (the peer is ourselves).
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let dist = self.distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return Some((31 - byte_idx) * 8 + bit);
            }
        }
        None
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs.
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = NodeId::generate();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(NodeId::from_hex(&hex), Some(id));
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(NodeId::from_hex("").is_none());
        assert!(NodeId::from_hex("abc").is_none());
        assert!(NodeId::from_hex(&"zz".repeat(32)).is_none());
    }

    #[test]
    fn test_key_id_deterministic() {
        let a = NodeId::for_key("deadbeef");
        let b = NodeId::for_key("deadbeef");
        let c = NodeId::for_key("cafebabe");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_distance_symmetric_and_zero_to_self() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; 32]);
    }

    #[test]
    fn test_bucket_index() {
        let zero = NodeId([0u8; 32]);
        let mut one = [0u8; 32];
        one[31] = 0x01;
        assert_eq!(zero.bucket_index(&NodeId(one)), Some(0));

        let mut top = [0u8; 32];
        top[0] = 0x80;
        assert_eq!(zero.bucket_index(&NodeId(top)), Some(255));

        assert_eq!(zero.bucket_index(&zero), None);
    }
}
