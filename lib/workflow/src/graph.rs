//! Workflow graph built on petgraph.
//!
//! The graph stores nodes as weights in a directed graph and keeps a
//! lookup table from node ID to graph index. Cycles are permitted:
//! re-engagement loops are a normal workflow shape, and runaway loops
//! are bounded by delay nodes and enrollment stops rather than by
//! structural validation.

use crate::edge::{Edge, EdgeDef};
use crate::error::GraphError;
use crate::node::{Node, NodeId};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

/// A directed graph of workflow nodes.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    graph: DiGraph<Node, Edge>,
    node_index_map: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index_map: HashMap::new(),
        }
    }

    /// Adds a node. Fails if a node with the same ID already exists.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        let node_id = node.id.clone();
        if self.node_index_map.contains_key(&node_id) {
            return Err(GraphError::DuplicateNodeId { node_id });
        }
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id.clone(), index);
        Ok(node_id)
    }

    /// Connects two nodes. Fails if either endpoint is missing.
    pub fn add_edge(
        &mut self,
        source: &NodeId,
        target: &NodeId,
        edge: Edge,
    ) -> Result<(), GraphError> {
        let &source_index =
            self.node_index_map
                .get(source)
                .ok_or_else(|| GraphError::UnknownEdgeEndpoint {
                    node_id: source.clone(),
                })?;
        let &target_index =
            self.node_index_map
                .get(target)
                .ok_or_else(|| GraphError::UnknownEdgeEndpoint {
                    node_id: target.clone(),
                })?;
        self.graph.add_edge(source_index, target_index, edge);
        Ok(())
    }

    /// Returns a node by ID.
    #[must_use]
    pub fn get_node(&self, node_id: &NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(node_id)?;
        self.graph.node_weight(*index)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Iterates over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns the workflow's trigger_start node, if present.
    #[must_use]
    pub fn trigger_node(&self) -> Option<&Node> {
        self.graph.node_weights().find(|node| node.is_trigger())
    }

    /// Returns each direct successor with the edge leading to it.
    #[must_use]
    pub fn successors(&self, node_id: &NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .filter_map(|edge| {
                let node = self.graph.node_weight(edge.target())?;
                Some((node, edge.weight()))
            })
            .collect()
    }

    /// Returns the successor of a linear node: the target of its
    /// handle-less edge, or of any edge if all carry handles.
    #[must_use]
    pub fn successor(&self, node_id: &NodeId) -> Option<&Node> {
        let successors = self.successors(node_id);
        successors
            .iter()
            .find(|(_, edge)| edge.source_handle.is_none())
            .or_else(|| successors.first())
            .map(|(node, _)| *node)
    }

    /// Returns the successor reached by following a branch handle.
    ///
    /// A handle-less edge out of a branching node serves as its `true`
    /// branch. Branches with no matching edge return `None`, which the
    /// runner treats as workflow completion.
    #[must_use]
    pub fn successor_for_handle(&self, node_id: &NodeId, handle: &str) -> Option<&Node> {
        let successors = self.successors(node_id);
        successors
            .iter()
            .find(|(_, edge)| edge.source_handle.as_deref() == Some(handle))
            .or_else(|| {
                if handle == "true" {
                    successors
                        .iter()
                        .find(|(_, edge)| edge.source_handle.is_none())
                } else {
                    None
                }
            })
            .map(|(node, _)| *node)
    }

    /// Returns every node reachable from the given node, including
    /// itself. Safe on cyclic graphs.
    #[must_use]
    pub fn reachable_from(&self, node_id: &NodeId) -> Vec<&Node> {
        let Some(&start) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };
        let mut reachable = Vec::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(index) = bfs.next(&self.graph) {
            if let Some(node) = self.graph.node_weight(index) {
                reachable.push(node);
            }
        }
        reachable
    }

    /// Validates the structural rules every runnable workflow must meet:
    /// exactly one trigger_start node. Edge endpoints are checked at
    /// construction, and declared branch handles without an edge are
    /// treated as workflow completion rather than errors.
    pub fn validate(&self) -> Result<(), GraphError> {
        let trigger_count = self
            .graph
            .node_weights()
            .filter(|node| node.is_trigger())
            .count();
        match trigger_count {
            0 => Err(GraphError::MissingTrigger),
            1 => Ok(()),
            count => Err(GraphError::MultipleTriggers { count }),
        }
    }
}

impl Serialize for WorkflowGraph {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let nodes: Vec<&Node> = self.graph.node_weights().collect();
        let edges: Vec<EdgeDef> = self
            .graph
            .edge_references()
            .filter_map(|edge| {
                let source = self.graph.node_weight(edge.source())?;
                let target = self.graph.node_weight(edge.target())?;
                Some(EdgeDef {
                    source: source.id.clone(),
                    source_handle: edge.weight().source_handle.clone(),
                    target: target.id.clone(),
                })
            })
            .collect();

        let mut state = serializer.serialize_struct("WorkflowGraph", 2)?;
        state.serialize_field("nodes", &nodes)?;
        state.serialize_field("edges", &edges)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for WorkflowGraph {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct GraphRepr {
            #[serde(default)]
            nodes: Vec<Node>,
            #[serde(default)]
            edges: Vec<EdgeDef>,
        }

        let repr = GraphRepr::deserialize(deserializer)?;
        let mut graph = WorkflowGraph::new();
        for node in repr.nodes {
            graph.add_node(node).map_err(serde::de::Error::custom)?;
        }
        for def in repr.edges {
            let (source, target, edge) = def.into_parts();
            graph
                .add_edge(&source, &target, edge)
                .map_err(serde::de::Error::custom)?;
        }
        Ok(graph)
    }
}
