//! Error types for workflow graph construction and validation.

use crate::node::NodeId;
use std::fmt;

/// Errors from graph operations and workflow validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A referenced node does not exist in the graph.
    NodeNotFound { node_id: NodeId },
    /// An edge references a node that does not exist.
    UnknownEdgeEndpoint { node_id: NodeId },
    /// The workflow has no trigger_start node.
    MissingTrigger,
    /// The workflow has more than one trigger_start node.
    MultipleTriggers { count: usize },
    /// Two nodes share the same ID.
    DuplicateNodeId { node_id: NodeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => {
                write!(f, "node '{node_id}' not found in graph")
            }
            Self::UnknownEdgeEndpoint { node_id } => {
                write!(f, "edge references unknown node '{node_id}'")
            }
            Self::MissingTrigger => {
                write!(f, "workflow has no trigger_start node")
            }
            Self::MultipleTriggers { count } => {
                write!(f, "workflow has {count} trigger_start nodes, expected exactly one")
            }
            Self::DuplicateNodeId { node_id } => {
                write!(f, "duplicate node id '{node_id}'")
            }
        }
    }
}

impl std::error::Error for GraphError {}
