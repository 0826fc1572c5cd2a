//! Core type definitions for svcmesh

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique name of a member in the cluster.
///
/// Names are stable for the lifetime of a process and unique within a
/// cluster; the membership table is keyed by them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new NodeId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation of the NodeId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        let id = NodeId::new("node-1");
        assert_eq!(id.to_string(), "node-1");
        assert_eq!(id.as_str(), "node-1");
    }

    #[test]
    fn test_node_id_from() {
        let a: NodeId = "node-1".into();
        let b: NodeId = String::from("node-1").into();
        assert_eq!(a, b);
    }
}
