//! Enrollment lifecycle: bulk enrollment, stop/pause/resume controls,
//! the inbound reply hook, and the parent/child bridge behind
//! call_sub_workflow nodes.

use crate::contact::ContactStore;
use crate::definition::Workflow;
use crate::enrollment::{EnrollmentStatus, WorkflowEnrollment};
use crate::execution::{ReplyChannel, ReplyFlag, WorkflowExecution};
use crate::node::{CallMode, NodeData, NodeId};
use crate::store::{EngineStore, StatusCounts, StoreError};
use crate::subflow::{ChildEnroller, ChildState, SubflowError};
use async_trait::async_trait;
use cadence_core::{ContactId, EnrollmentId, WorkflowId};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Errors from enrollment operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollError {
    WorkflowNotFound { workflow_id: WorkflowId },
    WorkflowDisabled { workflow_id: WorkflowId },
    InvalidWorkflow { message: String },
    EnrollmentNotFound { enrollment_id: EnrollmentId },
    Store { message: String },
    Contacts { message: String },
}

impl fmt::Display for EnrollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow '{workflow_id}' not found")
            }
            Self::WorkflowDisabled { workflow_id } => {
                write!(f, "workflow '{workflow_id}' is disabled")
            }
            Self::InvalidWorkflow { message } => {
                write!(f, "workflow is not runnable: {message}")
            }
            Self::EnrollmentNotFound { enrollment_id } => {
                write!(f, "enrollment '{enrollment_id}' not found")
            }
            Self::Store { message } | Self::Contacts { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for EnrollError {}

impl From<StoreError> for EnrollError {
    fn from(error: StoreError) -> Self {
        Self::Store {
            message: error.to_string(),
        }
    }
}

/// Per-contact failure detail from a bulk enroll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollFailure {
    pub contact_id: String,
    pub reason: String,
}

/// Summary of a bulk enroll call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrollOutcome {
    pub total: usize,
    pub enrolled: usize,
    pub skipped: usize,
    pub errors: Vec<EnrollFailure>,
}

enum EnrollOne {
    Enrolled,
    Skipped,
    Rejected(String),
}

/// Starts, stops, and observes workflow enrollments.
pub struct EnrollmentManager {
    store: Arc<dyn EngineStore>,
    contacts: Arc<dyn ContactStore>,
}

impl EnrollmentManager {
    #[must_use]
    pub fn new(store: Arc<dyn EngineStore>, contacts: Arc<dyn ContactStore>) -> Self {
        Self { store, contacts }
    }

    /// Enrolls a batch of contacts into a workflow. The workflow must
    /// exist, be enabled, and be structurally valid; anything else fails
    /// the whole call. Per-contact problems land in the outcome instead.
    pub async fn enroll_contacts(
        &self,
        workflow_id: &WorkflowId,
        contact_ids: &[String],
        skip_duplicates: bool,
    ) -> Result<EnrollOutcome, EnrollError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(EnrollError::WorkflowNotFound {
                workflow_id: *workflow_id,
            })?;
        if !workflow.enabled {
            return Err(EnrollError::WorkflowDisabled {
                workflow_id: *workflow_id,
            });
        }
        workflow
            .validate()
            .map_err(|e| EnrollError::InvalidWorkflow {
                message: e.to_string(),
            })?;
        warn_on_unbounded_sync_calls(&workflow);

        let start = workflow
            .start_node()
            .map_err(|e| EnrollError::InvalidWorkflow {
                message: e.to_string(),
            })?
            .id
            .clone();

        let mut outcome = EnrollOutcome {
            total: contact_ids.len(),
            ..EnrollOutcome::default()
        };
        for raw in contact_ids {
            let contact_id = match raw.parse::<ContactId>() {
                Ok(id) => id,
                Err(error) => {
                    outcome.errors.push(EnrollFailure {
                        contact_id: raw.clone(),
                        reason: error.to_string(),
                    });
                    continue;
                }
            };
            match self
                .enroll_one(&workflow, &start, contact_id, skip_duplicates)
                .await?
            {
                EnrollOne::Enrolled => outcome.enrolled += 1,
                EnrollOne::Skipped => outcome.skipped += 1,
                EnrollOne::Rejected(reason) => outcome.errors.push(EnrollFailure {
                    contact_id: raw.clone(),
                    reason,
                }),
            }
        }

        info!(
            workflow = %workflow_id,
            total = outcome.total,
            enrolled = outcome.enrolled,
            skipped = outcome.skipped,
            errors = outcome.errors.len(),
            "bulk enroll finished"
        );
        Ok(outcome)
    }

    async fn enroll_one(
        &self,
        workflow: &Workflow,
        start: &NodeId,
        contact_id: ContactId,
        skip_duplicates: bool,
    ) -> Result<EnrollOne, EnrollError> {
        let contact = self
            .contacts
            .get(&contact_id)
            .await
            .map_err(|e| EnrollError::Contacts {
                message: e.to_string(),
            })?;
        if contact.is_none() {
            return Ok(EnrollOne::Rejected(format!(
                "contact '{contact_id}' not found"
            )));
        }

        if self
            .store
            .find_active_enrollment(&workflow.id, &contact_id)
            .await?
            .is_some()
        {
            return Ok(if skip_duplicates {
                EnrollOne::Skipped
            } else {
                EnrollOne::Rejected("contact already has an active enrollment".to_string())
            });
        }

        let enrollment = WorkflowEnrollment::new(workflow.id, contact_id);
        let execution = WorkflowExecution::new(enrollment.id, start.clone());
        self.store.insert_enrollment(&enrollment, &execution).await?;
        Ok(EnrollOne::Enrolled)
    }

    /// Stops an enrollment and retires its parked cursor. Returns false
    /// when the enrollment had already ended.
    pub async fn stop_enrollment(
        &self,
        id: &EnrollmentId,
        reason: Option<String>,
    ) -> Result<bool, EnrollError> {
        let Some(mut enrollment) = self.store.get_enrollment(id).await? else {
            return Err(EnrollError::EnrollmentNotFound { enrollment_id: *id });
        };
        if !enrollment.stop(reason) {
            return Ok(false);
        }
        if !self.store.update_enrollment(&enrollment).await? {
            return Ok(false);
        }
        // an in-flight step keeps its claim; it observes the stop when
        // it persists
        self.store.skip_idle_execution(id).await?;
        info!(enrollment = %id, "enrollment stopped");
        Ok(true)
    }

    /// Pauses an active enrollment. The cursor keeps its schedule and
    /// becomes claimable again on resume.
    pub async fn pause_enrollment(&self, id: &EnrollmentId) -> Result<bool, EnrollError> {
        let Some(mut enrollment) = self.store.get_enrollment(id).await? else {
            return Err(EnrollError::EnrollmentNotFound { enrollment_id: *id });
        };
        if !enrollment.pause() {
            return Ok(false);
        }
        Ok(self.store.update_enrollment(&enrollment).await?)
    }

    /// Resumes a paused enrollment. Terminal enrollments stay terminal.
    pub async fn resume_enrollment(&self, id: &EnrollmentId) -> Result<bool, EnrollError> {
        let Some(mut enrollment) = self.store.get_enrollment(id).await? else {
            return Err(EnrollError::EnrollmentNotFound { enrollment_id: *id });
        };
        if !enrollment.resume() {
            return Ok(false);
        }
        Ok(self.store.update_enrollment(&enrollment).await?)
    }

    pub async fn get_enrollment(
        &self,
        id: &EnrollmentId,
    ) -> Result<Option<WorkflowEnrollment>, EnrollError> {
        Ok(self.store.get_enrollment(id).await?)
    }

    /// Enrollment counts per status for a workflow.
    pub async fn status_counts(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<StatusCounts, EnrollError> {
        Ok(self.store.status_counts(workflow_id).await?)
    }

    /// Records an inbound reply from a contact. Flags the execution
    /// cursor of every active enrollment whose remaining path holds a
    /// stop_on_reply node listening to the channel. Returns the number
    /// of cursors flagged.
    pub async fn on_reply_received(
        &self,
        contact_id: &ContactId,
        channel: ReplyChannel,
    ) -> Result<u32, EnrollError> {
        let enrollments = self.store.active_enrollments_for_contact(contact_id).await?;
        let mut flagged = 0;
        for enrollment in enrollments {
            let Some(workflow) = self.store.get_workflow(&enrollment.workflow_id).await? else {
                continue;
            };
            let Some(execution) = self.store.execution_for_enrollment(&enrollment.id).await?
            else {
                continue;
            };
            if !reply_can_stop(&workflow, &execution.current_node_id, channel) {
                continue;
            }
            let flag = ReplyFlag {
                channel,
                received_at: Utc::now(),
            };
            if self.store.flag_reply(&execution.id, &flag).await? {
                flagged += 1;
            }
        }
        if flagged > 0 {
            info!(contact = %contact_id, channel = channel.as_str(), flagged, "reply recorded");
        }
        Ok(flagged)
    }
}

/// True when a stop_on_reply node listening to `channel` is on the
/// enrollment's remaining path.
fn reply_can_stop(workflow: &Workflow, current: &NodeId, channel: ReplyChannel) -> bool {
    workflow.graph.reachable_from(current).iter().any(|node| {
        matches!(&node.data, NodeData::StopOnReply(config) if config.channel.matches(channel))
    })
}

fn warn_on_unbounded_sync_calls(workflow: &Workflow) {
    for node in workflow.graph.nodes() {
        if let NodeData::CallSubWorkflow(config) = &node.data {
            if config.mode == CallMode::Sync && config.timeout_seconds == 0 {
                warn!(
                    workflow = %workflow.id,
                    node = %node.id,
                    "sync sub-workflow call without a timeout can wait forever"
                );
            }
        }
    }
}

fn store_to_subflow(error: StoreError) -> SubflowError {
    SubflowError::Store {
        message: error.to_string(),
    }
}

#[async_trait]
impl ChildEnroller for EnrollmentManager {
    async fn enroll_child(
        &self,
        workflow_id: &WorkflowId,
        contact_id: &ContactId,
        parent_enrollment_id: &EnrollmentId,
        parent_node_id: &NodeId,
        inputs: Map<String, JsonValue>,
    ) -> Result<EnrollmentId, SubflowError> {
        // A still-running child from an earlier attempt of the same call
        // is reused rather than duplicated.
        if let Some(existing) = self
            .store
            .latest_child_enrollment(parent_enrollment_id, parent_node_id)
            .await
            .map_err(store_to_subflow)?
        {
            if !existing.status.is_terminal() {
                return Ok(existing.id);
            }
        }

        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(store_to_subflow)?
            .ok_or_else(|| SubflowError::Workflow {
                message: format!("workflow '{workflow_id}' not found"),
            })?;
        if !workflow.enabled {
            return Err(SubflowError::Workflow {
                message: format!("workflow '{workflow_id}' is disabled"),
            });
        }
        let start = workflow
            .start_node()
            .map_err(|e| SubflowError::Workflow {
                message: e.to_string(),
            })?
            .id
            .clone();

        let enrollment = WorkflowEnrollment::child_of(
            *workflow_id,
            *contact_id,
            *parent_enrollment_id,
            parent_node_id.clone(),
        );
        let mut execution = WorkflowExecution::new(enrollment.id, start);
        // call inputs are visible to the child's conditions and
        // templates under execution.inputs
        if !inputs.is_empty() {
            execution
                .data
                .extra
                .insert("inputs".to_string(), JsonValue::Object(inputs));
        }
        self.store
            .insert_enrollment(&enrollment, &execution)
            .await
            .map_err(store_to_subflow)?;
        info!(
            parent = %parent_enrollment_id,
            child = %enrollment.id,
            workflow = %workflow_id,
            "child enrollment started"
        );
        Ok(enrollment.id)
    }

    async fn child_state(&self, id: &EnrollmentId) -> Result<Option<ChildState>, SubflowError> {
        let Some(enrollment) = self
            .store
            .get_enrollment(id)
            .await
            .map_err(store_to_subflow)?
        else {
            return Ok(None);
        };
        let result = match enrollment.status {
            EnrollmentStatus::Completed => self
                .store
                .execution_for_enrollment(id)
                .await
                .map_err(store_to_subflow)?
                .and_then(|execution| execution.data.sub_workflow_result),
            _ => None,
        };
        Ok(Some(ChildState {
            status: enrollment.status,
            stop_reason: enrollment.stop_reason,
            result,
        }))
    }
}
