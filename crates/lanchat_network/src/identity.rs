//! Per-session node identification and origin ids.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width of the zero-padded sequence number in an origin id. Padding keeps
/// the lexicographic order of one node's ids equal to their creation order.
const SEQUENCE_WIDTH: usize = 12;

/// A unique identifier for a chat node, fresh for every session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generate a new random node ID (UUID v4, hyphen-free).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Create a NodeId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build the origin id for the `sequence`-th message authored by this node.
    pub fn origin_id(&self, sequence: u64) -> String {
        format!("{}-{:0width$}", self.0, sequence, width = SEQUENCE_WIDTH)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What this node advertises about itself on the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique node identifier for this session.
    pub node_id: NodeId,
    /// Display name of the local user.
    pub nickname: String,
    /// Software version string.
    pub version: String,
}

impl NodeIdentity {
    /// Create a new identity with a fresh NodeId.
    pub fn generate(nickname: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::generate(),
            nickname: nickname.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_generation() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(!a.as_str().contains('-'));
    }

    #[test]
    fn test_node_id_from_string() {
        let id = NodeId::from_string("node-123");
        assert_eq!(id.as_str(), "node-123");
        assert_eq!(format!("{id}"), "node-123");
    }

    #[test]
    fn test_origin_id_is_padded() {
        let id = NodeId::from_string("abc");
        assert_eq!(id.origin_id(7), "abc-000000000007");
    }

    #[test]
    fn test_origin_ids_sort_in_creation_order() {
        let id = NodeId::generate();
        let ninth = id.origin_id(9);
        let tenth = id.origin_id(10);
        assert!(ninth < tenth);
    }

    #[test]
    fn test_identity_generate() {
        let identity = NodeIdentity::generate("alice");
        assert_eq!(identity.nickname, "alice");
        assert!(!identity.node_id.as_str().is_empty());
        assert!(!identity.version.is_empty());
    }
}
