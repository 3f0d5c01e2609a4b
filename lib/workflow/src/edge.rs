//! Connections between workflow nodes.
//!
//! A connection is a directed edge from an output port on one node to an
//! input port on another. Many connections may share a source or a target.

use flowgrid_core::NodeId;
use serde::{Deserialize, Serialize};

/// The port name used when a connection does not name one.
pub const DEFAULT_PORT: &str = "main";

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    /// The node the edge leaves.
    pub source_node: NodeId,
    /// The node the edge enters.
    pub target_node: NodeId,
    /// Output port on the source node.
    #[serde(default = "default_port")]
    pub source_port: String,
    /// Input port on the target node.
    #[serde(default = "default_port")]
    pub target_port: String,
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

impl Connection {
    /// Creates a connection between explicit ports.
    #[must_use]
    pub fn new(
        source_node: impl Into<NodeId>,
        source_port: impl Into<String>,
        target_node: impl Into<NodeId>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            source_node: source_node.into(),
            target_node: target_node.into(),
            source_port: source_port.into(),
            target_port: target_port.into(),
        }
    }

    /// Creates a connection between the default ports.
    #[must_use]
    pub fn between(source_node: impl Into<NodeId>, target_node: impl Into<NodeId>) -> Self {
        Self::new(source_node, DEFAULT_PORT, target_node, DEFAULT_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_default_when_absent() {
        let conn: Connection =
            serde_json::from_str(r#"{"source_node":"a","target_node":"b"}"#).expect("parse");
        assert_eq!(conn, Connection::between("a", "b"));
    }

    #[test]
    fn explicit_ports_preserved() {
        let conn = Connection::new("if", "true", "notify", "main");
        assert_eq!(conn.source_port, "true");
        assert_eq!(conn.target_node.as_str(), "notify");
    }
}
