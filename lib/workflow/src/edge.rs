//! Edge types for workflow graphs.
//!
//! An edge connects two nodes and may carry a source handle naming which
//! branch of the source node it belongs to. Edges without a handle are
//! the plain "next step" connections used by linear nodes.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// The weight stored on each graph edge.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Edge {
    /// Branch handle on the source node, e.g. `true`, `false`,
    /// `group_0`, `else`. `None` for linear connections.
    pub source_handle: Option<String>,
}

impl Edge {
    /// Creates an edge with no source handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            source_handle: None,
        }
    }

    /// Creates an edge for a named branch of the source node.
    #[must_use]
    pub fn with_handle(handle: impl Into<String>) -> Self {
        Self {
            source_handle: Some(handle.into()),
        }
    }
}

/// External representation of an edge, as it appears in stored workflow
/// definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDef {
    /// The source node ID.
    pub source: NodeId,
    /// Branch handle on the source node, if any.
    #[serde(default, alias = "sourceHandle")]
    pub source_handle: Option<String>,
    /// The target node ID.
    pub target: NodeId,
}

impl EdgeDef {
    /// Creates an edge definition.
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            source_handle: None,
            target: target.into(),
        }
    }

    /// Creates an edge definition for a named branch.
    #[must_use]
    pub fn with_handle(
        source: impl Into<NodeId>,
        handle: impl Into<String>,
        target: impl Into<NodeId>,
    ) -> Self {
        Self {
            source: source.into(),
            source_handle: Some(handle.into()),
            target: target.into(),
        }
    }

    /// Splits this definition into graph endpoints and an edge weight.
    #[must_use]
    pub fn into_parts(self) -> (NodeId, NodeId, Edge) {
        (
            self.source,
            self.target,
            Edge {
                source_handle: self.source_handle,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_handles() {
        assert_eq!(Edge::new().source_handle, None);
        assert_eq!(
            Edge::with_handle("true").source_handle.as_deref(),
            Some("true")
        );
    }

    #[test]
    fn edge_def_accepts_camel_case_handle() {
        let json = serde_json::json!({
            "source": "split-1",
            "sourceHandle": "false",
            "target": "exit-1",
        });
        let def: EdgeDef = serde_json::from_value(json).expect("deserialize");
        assert_eq!(def.source, NodeId::from("split-1"));
        assert_eq!(def.source_handle.as_deref(), Some("false"));
        assert_eq!(def.target, NodeId::from("exit-1"));
    }

    #[test]
    fn edge_def_into_parts() {
        let def = EdgeDef::with_handle("a", "group_0", "b");
        let (source, target, edge) = def.into_parts();
        assert_eq!(source, NodeId::from("a"));
        assert_eq!(target, NodeId::from("b"));
        assert_eq!(edge.source_handle.as_deref(), Some("group_0"));
    }
}
