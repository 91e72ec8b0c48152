//! Sub-workflow calls: the bridge between a parent enrollment and the
//! child enrollments it spawns.
//!
//! Synchronous calls park the parent's execution cursor on the call
//! node and poll the child on each due cycle. Asynchronous calls start
//! the child and advance immediately.

use crate::condition::evaluate_value_expression;
use crate::enrollment::EnrollmentStatus;
use crate::execution::{SubWorkflowCall, SubWorkflowResult};
use crate::node::{CallMode, CallSubWorkflowData, Node, NodeData, NodeId, OnFailure};
use crate::processor::{NodeProcessor, ProcessError, ProcessorContext, ProcessorResult};
use async_trait::async_trait;
use cadence_core::{ContactId, EnrollmentId, WorkflowId};
use chrono::Duration;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How long a parked sync call waits between child status checks.
pub const CHILD_POLL_SECONDS: i64 = 5;

/// A child enrollment's progress, as seen from the parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildState {
    pub status: EnrollmentStatus,
    pub stop_reason: Option<String>,
    /// Result reported by the child's return node, if it ran one.
    pub result: Option<SubWorkflowResult>,
}

/// Errors from starting or observing child enrollments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubflowError {
    /// The target workflow cannot accept enrollments: missing, disabled,
    /// or structurally invalid.
    Workflow { message: String },
    /// The backing store failed. Worth retrying.
    Store { message: String },
}

impl fmt::Display for SubflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workflow { message } => write!(f, "sub-workflow rejected: {message}"),
            Self::Store { message } => write!(f, "sub-workflow store unavailable: {message}"),
        }
    }
}

impl std::error::Error for SubflowError {}

impl From<SubflowError> for ProcessError {
    fn from(error: SubflowError) -> Self {
        match error {
            SubflowError::Workflow { .. } => ProcessError::Fatal {
                message: error.to_string(),
            },
            SubflowError::Store { .. } => ProcessError::Transient {
                message: error.to_string(),
            },
        }
    }
}

/// Starts child enrollments and reports their progress back to the
/// call-sub-workflow processor.
#[async_trait]
pub trait ChildEnroller: Send + Sync {
    /// Enrolls the contact into the target workflow as a child of the
    /// given parent enrollment and call node.
    async fn enroll_child(
        &self,
        workflow_id: &WorkflowId,
        contact_id: &ContactId,
        parent_enrollment_id: &EnrollmentId,
        parent_node_id: &NodeId,
        inputs: Map<String, JsonValue>,
    ) -> Result<EnrollmentId, SubflowError>;

    /// Returns the child's current state, or `None` if no such
    /// enrollment exists.
    async fn child_state(&self, id: &EnrollmentId) -> Result<Option<ChildState>, SubflowError>;
}

/// Processor for call_sub_workflow nodes.
pub struct CallSubWorkflowProcessor {
    enroller: Arc<dyn ChildEnroller>,
}

impl CallSubWorkflowProcessor {
    #[must_use]
    pub fn new(enroller: Arc<dyn ChildEnroller>) -> Self {
        Self { enroller }
    }

    async fn start_child(
        &self,
        config: &CallSubWorkflowData,
        node: &Node,
        ctx: &ProcessorContext<'_>,
        attempts: u32,
    ) -> Result<ProcessorResult, ProcessError> {
        let mut inputs = Map::new();
        for mapping in &config.inputs {
            inputs.insert(
                mapping.name.clone(),
                evaluate_value_expression(&mapping.value, ctx.contact, &ctx.execution.data),
            );
        }

        let child_id = self
            .enroller
            .enroll_child(
                &config.workflow_id,
                &ctx.contact.id,
                &ctx.enrollment.id,
                &node.id,
                inputs,
            )
            .await?;

        // An async call resolves from the parent's point of view as soon
        // as the child is started.
        let completed_at = match config.mode {
            CallMode::Async => Some(ctx.now),
            CallMode::Sync => None,
        };
        let mut data = ctx.execution.data.clone();
        data.record_sub_workflow_call(
            node.id.clone(),
            SubWorkflowCall {
                child_enrollment_id: child_id,
                started_at: ctx.now,
                attempts,
                outputs: None,
                completed_at,
            },
        );

        match config.mode {
            CallMode::Async => Ok(advance_or_complete(node, ctx).with_data(data).with_output(
                json!({
                    "child_enrollment_id": child_id,
                    "mode": "async",
                }),
            )),
            CallMode::Sync => Ok(wait_at(node, ctx).with_data(data).with_output(json!({
                "child_enrollment_id": child_id,
                "mode": "sync",
                "attempt": attempts,
            }))),
        }
    }

    async fn poll_child(
        &self,
        config: &CallSubWorkflowData,
        node: &Node,
        ctx: &ProcessorContext<'_>,
        call: SubWorkflowCall,
    ) -> Result<ProcessorResult, ProcessError> {
        let state = self.enroller.child_state(&call.child_enrollment_id).await?;
        let Some(child) = state else {
            let reason = format!(
                "sub-workflow enrollment '{}' not found",
                call.child_enrollment_id
            );
            return self.handle_failure(config, node, ctx, call, reason).await;
        };

        match child.status {
            EnrollmentStatus::Completed => {
                // A child that completed without a return node counts as
                // a plain success with no outputs.
                let result = child.result.unwrap_or_else(|| SubWorkflowResult {
                    status: "success".to_string(),
                    outputs: Map::new(),
                });
                if result.status == "failure" {
                    let reason = "sub-workflow reported failure".to_string();
                    return self.handle_failure(config, node, ctx, call, reason).await;
                }

                let mut data = ctx.execution.data.clone();
                let mut resolved = call;
                resolved.outputs = Some(result.outputs.clone());
                resolved.completed_at = Some(ctx.now);
                data.record_sub_workflow_call(node.id.clone(), resolved);

                Ok(advance_or_complete(node, ctx).with_data(data).with_output(
                    json!({
                        "status": "success",
                        "outputs": result.outputs,
                    }),
                ))
            }
            EnrollmentStatus::Stopped | EnrollmentStatus::Failed => {
                let verb = if child.status == EnrollmentStatus::Stopped {
                    "stopped"
                } else {
                    "failed"
                };
                let reason = match child.stop_reason {
                    Some(detail) => format!("sub-workflow {verb}: {detail}"),
                    None => format!("sub-workflow {verb}"),
                };
                self.handle_failure(config, node, ctx, call, reason).await
            }
            EnrollmentStatus::Active | EnrollmentStatus::Paused => {
                let waited = (ctx.now - call.started_at).num_seconds();
                if config.timeout_seconds > 0 && waited >= config.timeout_seconds {
                    let reason =
                        format!("sub-workflow timed out after {}s", config.timeout_seconds);
                    self.handle_failure(config, node, ctx, call, reason).await
                } else {
                    Ok(wait_at(node, ctx).with_output(json!({
                        "child_enrollment_id": call.child_enrollment_id,
                        "waiting": true,
                    })))
                }
            }
        }
    }

    async fn handle_failure(
        &self,
        config: &CallSubWorkflowData,
        node: &Node,
        ctx: &ProcessorContext<'_>,
        call: SubWorkflowCall,
        reason: String,
    ) -> Result<ProcessorResult, ProcessError> {
        match config.on_failure {
            OnFailure::Stop => Err(ProcessError::Fatal { message: reason }),
            OnFailure::Continue => {
                let mut data = ctx.execution.data.clone();
                let mut resolved = call;
                resolved.completed_at = Some(ctx.now);
                data.record_sub_workflow_call(node.id.clone(), resolved);
                Ok(advance_or_complete(node, ctx).with_data(data).with_output(
                    json!({
                        "status": "failed",
                        "reason": reason,
                    }),
                ))
            }
            OnFailure::Retry => {
                if call.attempts <= config.retry_count {
                    self.start_child(config, node, ctx, call.attempts + 1).await
                } else {
                    Err(ProcessError::Fatal {
                        message: format!(
                            "{reason} (gave up after {} child enrollments)",
                            call.attempts
                        ),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl NodeProcessor for CallSubWorkflowProcessor {
    async fn process(
        &self,
        node: &Node,
        ctx: &ProcessorContext<'_>,
    ) -> Result<ProcessorResult, ProcessError> {
        let NodeData::CallSubWorkflow(config) = &node.data else {
            return Err(ProcessError::Fatal {
                message: format!("node '{}' is not a call_sub_workflow node", node.id),
            });
        };

        // A resolved call means this is a fresh visit, usually a loop
        // back through the node. Each visit gets its own retry budget.
        let in_flight = ctx
            .execution
            .data
            .sub_workflow_call(&node.id)
            .filter(|call| call.completed_at.is_none())
            .cloned();

        match in_flight {
            None => self.start_child(config, node, ctx, 1).await,
            Some(call) => self.poll_child(config, node, ctx, call).await,
        }
    }
}

fn advance_or_complete(node: &Node, ctx: &ProcessorContext<'_>) -> ProcessorResult {
    match ctx.workflow.graph.successor(&node.id) {
        Some(next) => ProcessorResult::advance(next.id.clone()),
        None => ProcessorResult::complete(),
    }
}

fn wait_at(node: &Node, ctx: &ProcessorContext<'_>) -> ProcessorResult {
    ProcessorResult::advance_at(node.id.clone(), ctx.now + Duration::seconds(CHILD_POLL_SECONDS))
}

/// One recorded `enroll_child` invocation.
#[derive(Debug, Clone)]
pub struct ChildCall {
    pub workflow_id: WorkflowId,
    pub contact_id: ContactId,
    pub parent_enrollment_id: EnrollmentId,
    pub parent_node_id: NodeId,
    pub inputs: Map<String, JsonValue>,
    pub child_id: EnrollmentId,
}

/// Scripted enroller double. Every `enroll_child` creates a fresh
/// active child; tests flip child states with [`StubEnroller::set_child_state`].
#[derive(Debug, Default)]
pub struct StubEnroller {
    children: Mutex<HashMap<EnrollmentId, ChildState>>,
    calls: Mutex<Vec<ChildCall>>,
}

impl StubEnroller {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the state reported for a child enrollment.
    pub fn set_child_state(&self, id: EnrollmentId, state: ChildState) {
        self.children_lock().insert(id, state);
    }

    /// Every `enroll_child` invocation, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ChildCall> {
        self.calls_lock().clone()
    }

    /// The most recently created child enrollment.
    #[must_use]
    pub fn last_child(&self) -> Option<EnrollmentId> {
        self.calls_lock().last().map(|call| call.child_id)
    }

    fn children_lock(&self) -> MutexGuard<'_, HashMap<EnrollmentId, ChildState>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn calls_lock(&self) -> MutexGuard<'_, Vec<ChildCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChildEnroller for StubEnroller {
    async fn enroll_child(
        &self,
        workflow_id: &WorkflowId,
        contact_id: &ContactId,
        parent_enrollment_id: &EnrollmentId,
        parent_node_id: &NodeId,
        inputs: Map<String, JsonValue>,
    ) -> Result<EnrollmentId, SubflowError> {
        let child_id = EnrollmentId::new();
        self.children_lock().insert(
            child_id,
            ChildState {
                status: EnrollmentStatus::Active,
                stop_reason: None,
                result: None,
            },
        );
        self.calls_lock().push(ChildCall {
            workflow_id: *workflow_id,
            contact_id: *contact_id,
            parent_enrollment_id: *parent_enrollment_id,
            parent_node_id: parent_node_id.clone(),
            inputs,
            child_id,
        });
        Ok(child_id)
    }

    async fn child_state(&self, id: &EnrollmentId) -> Result<Option<ChildState>, SubflowError> {
        Ok(self.children_lock().get(id).cloned())
    }
}
