//! Enrollment records: a contact's membership in a workflow.

use crate::node::NodeId;
use cadence_core::{ContactId, EnrollmentId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    /// The contact is progressing through the workflow.
    Active,
    /// Progress is suspended; the execution cursor is preserved.
    Paused,
    /// The contact reached the end of the workflow.
    Completed,
    /// The enrollment was ended early, by an operator or a stop node.
    Stopped,
    /// A step failed permanently.
    Failed,
}

impl EnrollmentStatus {
    /// Returns the status as a stable string for storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored status string. Unknown values map to `Active`.
    #[must_use]
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "stopped" => Self::Stopped,
            "failed" => Self::Failed,
            _ => Self::Active,
        }
    }

    /// Returns true if this is a terminal state. Terminal enrollments
    /// never change status again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }
}

/// A record of a contact enrolled in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEnrollment {
    /// Unique identifier for this enrollment.
    pub id: EnrollmentId,
    /// The workflow the contact is enrolled in.
    pub workflow_id: WorkflowId,
    /// The enrolled contact.
    pub contact_id: ContactId,
    /// Current lifecycle state.
    pub status: EnrollmentStatus,
    /// When the enrollment was created.
    pub enrolled_at: DateTime<Utc>,
    /// When the enrollment completed normally.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the enrollment was stopped or failed.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Why the enrollment ended early, if it did.
    pub stop_reason: Option<String>,
    /// Set when this enrollment was created by a call-sub-workflow node.
    pub parent_enrollment_id: Option<EnrollmentId>,
    /// The call node in the parent workflow that created this enrollment.
    pub parent_node_id: Option<NodeId>,
}

impl WorkflowEnrollment {
    /// Creates a new active enrollment.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, contact_id: ContactId) -> Self {
        Self {
            id: EnrollmentId::new(),
            workflow_id,
            contact_id,
            status: EnrollmentStatus::Active,
            enrolled_at: Utc::now(),
            completed_at: None,
            stopped_at: None,
            stop_reason: None,
            parent_enrollment_id: None,
            parent_node_id: None,
        }
    }

    /// Creates a child enrollment on behalf of a call-sub-workflow node.
    #[must_use]
    pub fn child_of(
        workflow_id: WorkflowId,
        contact_id: ContactId,
        parent_enrollment_id: EnrollmentId,
        parent_node_id: NodeId,
    ) -> Self {
        let mut enrollment = Self::new(workflow_id, contact_id);
        enrollment.parent_enrollment_id = Some(parent_enrollment_id);
        enrollment.parent_node_id = Some(parent_node_id);
        enrollment
    }

    /// Returns true if this enrollment was created by another workflow.
    #[must_use]
    pub fn is_child(&self) -> bool {
        self.parent_enrollment_id.is_some()
    }

    /// Marks the enrollment as completed. Returns false if it was
    /// already terminal.
    pub fn complete(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = EnrollmentStatus::Completed;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Stops the enrollment early. Returns false if it was already
    /// terminal.
    pub fn stop(&mut self, reason: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = EnrollmentStatus::Stopped;
        self.stopped_at = Some(Utc::now());
        self.stop_reason = reason;
        true
    }

    /// Marks the enrollment as failed. Returns false if it was already
    /// terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = EnrollmentStatus::Failed;
        self.stopped_at = Some(Utc::now());
        self.stop_reason = Some(reason.into());
        true
    }

    /// Suspends an active enrollment. Returns false unless the
    /// enrollment was active.
    pub fn pause(&mut self) -> bool {
        if self.status != EnrollmentStatus::Active {
            return false;
        }
        self.status = EnrollmentStatus::Paused;
        true
    }

    /// Resumes a paused enrollment. Returns false unless the enrollment
    /// was paused.
    pub fn resume(&mut self) -> bool {
        if self.status != EnrollmentStatus::Paused {
            return false;
        }
        self.status = EnrollmentStatus::Active;
        true
    }
}
