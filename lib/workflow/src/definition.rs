//! Workflow definitions.

use crate::error::GraphError;
use crate::graph::WorkflowGraph;
use crate::node::Node;
use cadence_core::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A complete workflow definition: metadata plus the node graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier.
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// Optional description shown in the editor.
    #[serde(default)]
    pub description: Option<String>,
    /// Disabled workflows refuse new enrollments. Existing enrollments
    /// keep running.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// The node graph.
    #[serde(default)]
    pub graph: WorkflowGraph,
    /// When the workflow was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When the workflow was last modified.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Workflow {
    /// Creates an enabled workflow with an empty graph.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: None,
            enabled: true,
            graph: WorkflowGraph::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a workflow with an explicit ID.
    #[must_use]
    pub fn with_id(id: WorkflowId, name: impl Into<String>) -> Self {
        let mut workflow = Self::new(name);
        workflow.id = id;
        workflow
    }

    /// Returns the entry node new enrollments start at.
    pub fn start_node(&self) -> Result<&Node, GraphError> {
        self.graph.trigger_node().ok_or(GraphError::MissingTrigger)
    }

    /// Validates the workflow's structural rules.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.graph.validate()
    }

    /// Records a modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
