//! Execution state for enrollments.
//!
//! Each active enrollment owns exactly one [`WorkflowExecution`] cursor
//! pointing at the node to run next. The scheduler claims due cursors,
//! the step runner processes them, and every attempt leaves a
//! [`WorkflowExecutionLog`] row behind.

use crate::node::{Node, NodeId};
use cadence_core::{EnrollmentId, ExecutionId, ExecutionLogId, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// Default number of attempts before a step fails the enrollment.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Current schema version for [`ExecutionData`].
pub const EXECUTION_DATA_VERSION: u32 = 1;

/// Lifecycle state of an execution cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Eligible for claiming once `next_run_at` passes.
    Waiting,
    /// Claimed by a scheduler tick; a step is in flight.
    Processing,
    /// The enrollment finished; no further steps will run.
    Completed,
    /// A step failed permanently.
    Failed,
    /// The enrollment ended while the cursor was idle.
    Skipped,
}

impl ExecutionStatus {
    /// Returns the status as a stable string for storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parses a stored status string. Unknown values map to `Waiting`.
    #[must_use]
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => Self::Waiting,
        }
    }

    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Channel of an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyChannel {
    Sms,
    Email,
}

impl ReplyChannel {
    /// Returns the channel as a stable string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

/// A recorded inbound reply, consumed by stop-on-reply nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFlag {
    /// Channel the reply arrived on.
    pub channel: ReplyChannel,
    /// When the reply was recorded.
    pub received_at: DateTime<Utc>,
}

/// State of one sub-workflow invocation made by a call node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowCall {
    /// The child enrollment created for this invocation.
    pub child_enrollment_id: EnrollmentId,
    /// When the current child was started.
    pub started_at: DateTime<Utc>,
    /// How many children have been started for this node, including
    /// retries.
    pub attempts: u32,
    /// Outputs copied back from the child once it resolved.
    #[serde(default)]
    pub outputs: Option<Map<String, JsonValue>>,
    /// Set when the call resolved. A later visit to the same node starts
    /// a fresh invocation.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The result a child workflow reported through a return-to-parent node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowResult {
    /// Reported status, usually `success` or `failure`.
    pub status: String,
    /// Values declared by the return node's output mappings.
    #[serde(default)]
    pub outputs: Map<String, JsonValue>,
}

/// Durable per-enrollment scratch state carried by the execution cursor.
///
/// Unknown keys survive round trips through the `extra` map, so older
/// engine versions do not drop data written by newer ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionData {
    /// Schema version for forward migrations.
    pub version: u32,
    /// Result of the most recent conditional split.
    pub last_condition_result: Option<bool>,
    /// Branch handle taken at the most recent conditional split.
    pub last_branch: Option<String>,
    /// Messages sent on behalf of this enrollment.
    pub sent_message_ids: Vec<MessageId>,
    /// Set when an inbound reply was recorded for this enrollment.
    pub stopped_by_reply: Option<ReplyFlag>,
    /// Per-node state of call-sub-workflow invocations.
    pub sub_workflows: BTreeMap<NodeId, SubWorkflowCall>,
    /// Result reported by this enrollment's return-to-parent node.
    pub sub_workflow_result: Option<SubWorkflowResult>,
    /// Unrecognized keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Default for ExecutionData {
    fn default() -> Self {
        Self {
            version: EXECUTION_DATA_VERSION,
            last_condition_result: None,
            last_branch: None,
            sent_message_ids: Vec::new(),
            stopped_by_reply: None,
            sub_workflows: BTreeMap::new(),
            sub_workflow_result: None,
            extra: Map::new(),
        }
    }
}

impl ExecutionData {
    /// Records the outcome of a conditional split.
    pub fn record_branch(&mut self, matched: bool, branch: impl Into<String>) {
        self.last_condition_result = Some(matched);
        self.last_branch = Some(branch.into());
    }

    /// Records a sent message ID.
    pub fn record_sent_message(&mut self, message_id: MessageId) {
        self.sent_message_ids.push(message_id);
    }

    /// Records a reply flag. Returns false if a reply was already
    /// recorded; the first writer wins.
    pub fn set_reply(&mut self, flag: ReplyFlag) -> bool {
        if self.stopped_by_reply.is_some() {
            return false;
        }
        self.stopped_by_reply = Some(flag);
        true
    }

    /// Returns the sub-workflow call state for a node, if any.
    #[must_use]
    pub fn sub_workflow_call(&self, node_id: &NodeId) -> Option<&SubWorkflowCall> {
        self.sub_workflows.get(node_id)
    }

    /// Replaces the sub-workflow call state for a node.
    pub fn record_sub_workflow_call(&mut self, node_id: NodeId, call: SubWorkflowCall) {
        self.sub_workflows.insert(node_id, call);
    }

    /// Resolves a dotted path within the execution data.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<JsonValue> {
        let (head, rest) = match path.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (path, None),
        };
        match head {
            "version" => Some(JsonValue::from(self.version)),
            "last_condition_result" => self.last_condition_result.map(JsonValue::Bool),
            "last_branch" => self.last_branch.clone().map(JsonValue::String),
            _ => {
                let root = self.extra.get(head)?;
                match rest {
                    Some(r) => crate::condition::walk_value(root, r).cloned(),
                    None => Some(root.clone()),
                }
            }
        }
    }
}

/// The execution cursor for one enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique identifier for this cursor.
    pub id: ExecutionId,
    /// The enrollment this cursor belongs to.
    pub enrollment_id: EnrollmentId,
    /// The node to run next (or currently running).
    pub current_node_id: NodeId,
    /// Current lifecycle state.
    pub status: ExecutionStatus,
    /// Earliest time the cursor is due. `None` means due immediately.
    pub next_run_at: Option<DateTime<Utc>>,
    /// When the cursor was last claimed.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Attempts made at the current node since the last successful step.
    pub attempts: u32,
    /// Attempt budget before the step fails the enrollment.
    pub max_attempts: u32,
    /// Error from the most recent failed attempt.
    pub error_message: Option<String>,
    /// Durable scratch state.
    pub data: ExecutionData,
    /// When the cursor was created.
    pub created_at: DateTime<Utc>,
    /// When the cursor was last written.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Creates a cursor positioned at a workflow's start node, due
    /// immediately.
    #[must_use]
    pub fn new(enrollment_id: EnrollmentId, start_node: NodeId) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            enrollment_id,
            current_node_id: start_node,
            status: ExecutionStatus::Waiting,
            next_run_at: Some(now),
            last_run_at: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            error_message: None,
            data: ExecutionData::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the cursor is claimable at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Waiting
            && self.next_run_at.is_none_or(|due| due <= now)
    }

    /// Transitions waiting -> processing and consumes an attempt. Called
    /// by the store when the cursor is claimed.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Processing;
        self.attempts += 1;
        self.last_run_at = Some(now);
        self.updated_at = now;
    }

    /// Moves the cursor to the next node after a successful step. Resets
    /// the attempt count.
    pub fn advance_to(&mut self, node_id: NodeId, next_run_at: Option<DateTime<Utc>>) {
        self.current_node_id = node_id;
        self.status = ExecutionStatus::Waiting;
        self.next_run_at = next_run_at;
        self.attempts = 0;
        self.error_message = None;
        self.touch();
    }

    /// Schedules another attempt at the same node after a transient
    /// failure. The attempt count is preserved.
    pub fn retry_at(&mut self, next_run_at: DateTime<Utc>, error: impl Into<String>) {
        self.status = ExecutionStatus::Waiting;
        self.next_run_at = Some(next_run_at);
        self.error_message = Some(error.into());
        self.touch();
    }

    /// Returns a claimed cursor to the queue without consuming an
    /// attempt.
    pub fn release(&mut self, next_run_at: DateTime<Utc>) {
        self.status = ExecutionStatus::Waiting;
        self.next_run_at = Some(next_run_at);
        self.attempts = self.attempts.saturating_sub(1);
        self.touch();
    }

    /// Marks the cursor as completed.
    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.next_run_at = None;
        self.touch();
    }

    /// Marks the cursor as permanently failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.next_run_at = None;
        self.error_message = Some(error.into());
        self.touch();
    }

    /// Marks the cursor as skipped because the enrollment ended.
    pub fn skip(&mut self) {
        self.status = ExecutionStatus::Skipped;
        self.next_run_at = None;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Status of a single node execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLogStatus {
    /// The attempt is in flight. Present for tooling that writes ahead;
    /// the step runner only writes outcome rows.
    Started,
    /// The node ran successfully.
    Completed,
    /// The attempt failed.
    Failed,
    /// The node was not run because the enrollment had ended.
    Skipped,
}

impl ExecutionLogStatus {
    /// Returns the status as a stable string for storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parses a stored status string. Unknown values map to `Failed`.
    #[must_use]
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "started" => Self::Started,
            "completed" => Self::Completed,
            "skipped" => Self::Skipped,
            _ => Self::Failed,
        }
    }
}

/// Append-only audit record for one node execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionLog {
    /// Unique identifier for this log row.
    pub id: ExecutionLogId,
    /// The cursor this attempt belongs to.
    pub execution_id: ExecutionId,
    /// The enrollment this attempt belongs to.
    pub enrollment_id: EnrollmentId,
    /// The node that was (or would have been) executed.
    pub node_id: NodeId,
    /// The node type, denormalized for queries.
    pub node_type: String,
    /// Outcome of the attempt.
    pub status: ExecutionLogStatus,
    /// The node configuration at execution time.
    pub input_data: Option<JsonValue>,
    /// Structured output produced by the processor.
    pub output_data: Option<JsonValue>,
    /// Error message when the attempt failed.
    pub error_message: Option<String>,
    /// Wall-clock duration of the attempt.
    pub duration_ms: Option<i64>,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecutionLog {
    /// Creates a log row for an attempt on the given cursor.
    #[must_use]
    pub fn new(
        execution: &WorkflowExecution,
        node_id: NodeId,
        node_type: impl Into<String>,
        status: ExecutionLogStatus,
    ) -> Self {
        Self {
            id: ExecutionLogId::new(),
            execution_id: execution.id,
            enrollment_id: execution.enrollment_id,
            node_id,
            node_type: node_type.into(),
            status,
            input_data: None,
            output_data: None,
            error_message: None,
            duration_ms: None,
            created_at: Utc::now(),
        }
    }

    /// Creates a log row for an attempt on a specific node.
    #[must_use]
    pub fn for_node(
        execution: &WorkflowExecution,
        node: &Node,
        status: ExecutionLogStatus,
    ) -> Self {
        Self::new(execution, node.id.clone(), node.kind(), status)
    }

    /// Attaches the node configuration that was executed.
    #[must_use]
    pub fn with_input(mut self, input: JsonValue) -> Self {
        self.input_data = Some(input);
        self
    }

    /// Attaches the processor's structured output.
    #[must_use]
    pub fn with_output(mut self, output: Option<JsonValue>) -> Self {
        self.output_data = output;
        self
    }

    /// Attaches an error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    /// Attaches the attempt duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}
