//! Node types for automation workflows.
//!
//! A workflow is a directed graph of nodes. Each node carries a typed
//! configuration payload describing what happens when an enrolled contact
//! reaches it: wait, branch, send a message, update the contact, or hand
//! off to another workflow.

use crate::condition::ConditionalSplitData;
use cadence_core::{SenderIdentityId, TemplateId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use ulid::Ulid;

/// Identifier for a node within a workflow graph.
///
/// Node IDs are plain strings rather than typed ULIDs because workflow
/// definitions arrive from external editors that assign their own IDs.
/// Freshly created nodes get a `node_<ulid>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new node ID with a randomly generated suffix.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("node_{}", Ulid::new()))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the workflow.
    pub id: NodeId,
    /// Human-readable label shown in the editor.
    #[serde(default)]
    pub name: String,
    /// Typed configuration for this node.
    #[serde(flatten)]
    pub data: NodeData,
}

impl Node {
    /// Creates a node with a generated ID.
    #[must_use]
    pub fn new(name: impl Into<String>, data: NodeData) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            data,
        }
    }

    /// Creates a node with an explicit ID.
    #[must_use]
    pub fn with_id(id: impl Into<NodeId>, name: impl Into<String>, data: NodeData) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data,
        }
    }

    /// Returns the node type as a stable string.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.data.kind()
    }

    /// Returns true if this node is a workflow entry point.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        matches!(self.data, NodeData::TriggerStart)
    }
}

/// Typed configuration payload for each node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeData {
    /// Entry point of the workflow. Every workflow has exactly one.
    TriggerStart,
    /// Pauses the enrollment for a configured duration.
    TimeDelay(TimeDelayData),
    /// Routes the enrollment down a branch based on contact and execution data.
    ConditionalSplit(ConditionalSplitData),
    /// Sends an SMS from a template.
    SendSms(SendMessageData),
    /// Sends an email from a template.
    SendEmail(SendMessageData),
    /// Updates the contact's pipeline status.
    UpdateStatus(UpdateStatusData),
    /// Ends the enrollment if the contact has replied.
    StopOnReply(StopOnReplyData),
    /// Reports a result back to the calling workflow and ends this enrollment.
    ReturnToParent(ReturnToParentData),
    /// Enrolls the contact into another workflow.
    CallSubWorkflow(CallSubWorkflowData),
}

impl NodeData {
    /// Returns the node type as a stable string matching the wire format.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TriggerStart => "trigger_start",
            Self::TimeDelay(_) => "time_delay",
            Self::ConditionalSplit(_) => "conditional_split",
            Self::SendSms(_) => "send_sms",
            Self::SendEmail(_) => "send_email",
            Self::UpdateStatus(_) => "update_status",
            Self::StopOnReply(_) => "stop_on_reply",
            Self::ReturnToParent(_) => "return_to_parent",
            Self::CallSubWorkflow(_) => "call_sub_workflow",
        }
    }
}

/// Units for time delay nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    #[default]
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    /// Converts an amount in this unit to a duration.
    #[must_use]
    pub fn to_duration(self, amount: i64) -> chrono::Duration {
        match self {
            Self::Minutes => chrono::Duration::minutes(amount),
            Self::Hours => chrono::Duration::hours(amount),
            Self::Days => chrono::Duration::days(amount),
        }
    }
}

/// Configuration for a time delay node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeDelayData {
    /// How many units to wait.
    #[serde(default = "default_delay_duration")]
    pub duration: i64,
    /// The unit of the duration.
    #[serde(default)]
    pub unit: DelayUnit,
}

impl TimeDelayData {
    /// Returns the configured delay as a duration.
    #[must_use]
    pub fn delay(&self) -> chrono::Duration {
        self.unit.to_duration(self.duration.max(0))
    }
}

fn default_delay_duration() -> i64 {
    1
}

/// Configuration shared by SMS and email send nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageData {
    /// The template to render and send.
    #[serde(alias = "templateId")]
    pub template_id: TemplateId,
    /// Optional explicit sending identity. Falls back to the transport default.
    #[serde(default, alias = "fromIdentity")]
    pub from_identity: Option<SenderIdentityId>,
}

/// Configuration for an update status node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatusData {
    /// The pipeline status to assign to the contact.
    pub status: String,
}

/// Which inbound channels a stop-on-reply node listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyChannelFilter {
    /// Any inbound reply ends the enrollment.
    #[default]
    Any,
    /// Only SMS replies.
    Sms,
    /// Only email replies.
    Email,
}

impl ReplyChannelFilter {
    /// Returns true if a reply on the given channel satisfies this filter.
    #[must_use]
    pub fn matches(self, channel: crate::execution::ReplyChannel) -> bool {
        use crate::execution::ReplyChannel;
        match self {
            Self::Any => true,
            Self::Sms => channel == ReplyChannel::Sms,
            Self::Email => channel == ReplyChannel::Email,
        }
    }
}

/// Configuration for a stop-on-reply node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopOnReplyData {
    /// Which reply channels end the enrollment.
    #[serde(default)]
    pub channel: ReplyChannelFilter,
}

/// A named value to pass across a workflow boundary.
///
/// The value may be a literal, or a string containing `{{path}}`
/// expressions resolved against the contact and execution data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Name of the field on the receiving side.
    pub name: String,
    /// Literal value or `{{path}}` expression.
    #[serde(default)]
    pub value: JsonValue,
}

/// Configuration for a return-to-parent node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnToParentData {
    /// Result status reported to the caller. Literal `success`/`failure`,
    /// or a `{{path}}` expression resolved at execution time.
    #[serde(default = "default_return_status", alias = "resultStatus")]
    pub result_status: String,
    /// Values copied back to the calling workflow.
    #[serde(default)]
    pub outputs: Vec<FieldMapping>,
}

fn default_return_status() -> String {
    "success".to_string()
}

/// Invocation mode for a sub-workflow call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    /// Wait for the child workflow to finish before advancing.
    #[default]
    Sync,
    /// Start the child workflow and advance immediately.
    Async,
}

/// What to do when a synchronous sub-workflow call fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Fail the calling enrollment.
    #[default]
    Stop,
    /// Advance past the call node without outputs.
    Continue,
    /// Start a fresh child enrollment, up to `retry_count` times.
    Retry,
}

/// Configuration for a call-sub-workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSubWorkflowData {
    /// The workflow to enroll the contact into.
    #[serde(alias = "workflowId")]
    pub workflow_id: WorkflowId,
    /// Whether to wait for the child or fire and forget.
    #[serde(default)]
    pub mode: CallMode,
    /// Values passed to the child as its execution input.
    #[serde(default)]
    pub inputs: Vec<FieldMapping>,
    /// Maximum seconds to wait for a synchronous child. Zero disables the
    /// timeout entirely.
    #[serde(default = "default_timeout_seconds", alias = "timeoutSeconds")]
    pub timeout_seconds: i64,
    /// Failure handling for synchronous calls.
    #[serde(default, alias = "onFailure")]
    pub on_failure: OnFailure,
    /// Additional child enrollments allowed when `on_failure` is `retry`.
    #[serde(default = "default_retry_count", alias = "retryCount")]
    pub retry_count: u32,
}

/// Default sub-workflow wait budget: one hour.
pub const DEFAULT_SUB_WORKFLOW_TIMEOUT_SECONDS: i64 = 3600;

fn default_timeout_seconds() -> i64 {
    DEFAULT_SUB_WORKFLOW_TIMEOUT_SECONDS
}

fn default_retry_count() -> u32 {
    1
}
