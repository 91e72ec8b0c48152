//! Node processors: the unit of work behind each node type.
//!
//! A processor receives the node configuration and a read-only context,
//! and returns a [`ProcessorResult`] describing the transition to apply.
//! Processors never write storage themselves; the step runner persists
//! the whole step atomically.

use crate::contact::{Contact, ContactStore};
use crate::definition::Workflow;
use crate::enrollment::WorkflowEnrollment;
use crate::execution::{ExecutionData, SubWorkflowResult, WorkflowExecution};
use crate::messaging::{MessageSender, SendMessageProcessor, TemplateStore};
use crate::node::{Node, NodeData, NodeId};
use crate::subflow::{CallSubWorkflowProcessor, ChildEnroller};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Read-only context handed to processors.
#[derive(Clone, Copy)]
pub struct ProcessorContext<'a> {
    /// The workflow being executed.
    pub workflow: &'a Workflow,
    /// The enrollment the step belongs to.
    pub enrollment: &'a WorkflowEnrollment,
    /// The execution cursor as claimed.
    pub execution: &'a WorkflowExecution,
    /// The enrolled contact, loaded fresh for this step.
    pub contact: &'a Contact,
    /// The step's logical clock. All time arithmetic uses this instant.
    pub now: DateTime<Utc>,
}

/// Errors a processor can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The step may succeed if retried: provider hiccups, store timeouts.
    Transient { message: String },
    /// Retrying cannot help: bad configuration, missing records.
    Fatal { message: String },
}

impl ProcessError {
    /// Returns true if the runner should schedule a retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { message } => write!(f, "transient: {message}"),
            Self::Fatal { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ProcessError {}

/// The transition a successful step applies to the execution cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorResult {
    /// Node to advance to. `None` completes the enrollment.
    pub next_node: Option<NodeId>,
    /// Earliest time the next step is due. `None` means immediately.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Replacement execution data, when the step changed it.
    pub data: Option<ExecutionData>,
    /// Structured output recorded in the execution log.
    pub output: Option<JsonValue>,
    /// When set, the enrollment stops early with this reason.
    pub stop_reason: Option<String>,
}

impl ProcessorResult {
    /// Advance to a node, due immediately.
    #[must_use]
    pub fn advance(next_node: NodeId) -> Self {
        Self {
            next_node: Some(next_node),
            next_run_at: None,
            data: None,
            output: None,
            stop_reason: None,
        }
    }

    /// Advance to a node, due at a given time.
    #[must_use]
    pub fn advance_at(next_node: NodeId, next_run_at: DateTime<Utc>) -> Self {
        Self {
            next_run_at: Some(next_run_at),
            ..Self::advance(next_node)
        }
    }

    /// Complete the enrollment.
    #[must_use]
    pub fn complete() -> Self {
        Self {
            next_node: None,
            next_run_at: None,
            data: None,
            output: None,
            stop_reason: None,
        }
    }

    /// Stop the enrollment early.
    #[must_use]
    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            stop_reason: Some(reason.into()),
            ..Self::complete()
        }
    }

    /// Attaches replacement execution data.
    #[must_use]
    pub fn with_data(mut self, data: ExecutionData) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches structured output for the execution log.
    #[must_use]
    pub fn with_output(mut self, output: JsonValue) -> Self {
        self.output = Some(output);
        self
    }
}

/// A processor for one node type.
#[async_trait]
pub trait NodeProcessor: Send + Sync {
    /// Runs the node and returns the transition to apply.
    async fn process(
        &self,
        node: &Node,
        ctx: &ProcessorContext<'_>,
    ) -> Result<ProcessorResult, ProcessError>;
}

/// Lookup table from node type to processor.
pub struct ProcessorRegistry {
    processors: HashMap<&'static str, Arc<dyn NodeProcessor>>,
}

impl ProcessorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }

    /// Creates a registry with the standard processors wired to the
    /// given collaborators.
    #[must_use]
    pub fn standard(
        contacts: Arc<dyn ContactStore>,
        templates: Arc<dyn TemplateStore>,
        sender: Arc<dyn MessageSender>,
        enroller: Arc<dyn ChildEnroller>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register("trigger_start", Arc::new(TriggerStartProcessor));
        registry.register("time_delay", Arc::new(TimeDelayProcessor));
        registry.register("conditional_split", Arc::new(ConditionalSplitProcessor));
        registry.register(
            "send_sms",
            Arc::new(SendMessageProcessor::sms(templates.clone(), sender.clone())),
        );
        registry.register(
            "send_email",
            Arc::new(SendMessageProcessor::email(templates, sender)),
        );
        registry.register("update_status", Arc::new(UpdateStatusProcessor::new(contacts)));
        registry.register("stop_on_reply", Arc::new(StopOnReplyProcessor));
        registry.register("return_to_parent", Arc::new(ReturnToParentProcessor));
        registry.register(
            "call_sub_workflow",
            Arc::new(CallSubWorkflowProcessor::new(enroller)),
        );
        registry
    }

    /// Registers a processor for a node type, replacing any existing one.
    pub fn register(&mut self, kind: &'static str, processor: Arc<dyn NodeProcessor>) {
        self.processors.insert(kind, processor);
    }

    /// Returns the processor for a node type.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<dyn NodeProcessor>> {
        self.processors.get(kind).cloned()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Processor for trigger_start nodes: advance to the first real node.
pub struct TriggerStartProcessor;

#[async_trait]
impl NodeProcessor for TriggerStartProcessor {
    async fn process(
        &self,
        node: &Node,
        ctx: &ProcessorContext<'_>,
    ) -> Result<ProcessorResult, ProcessError> {
        match ctx.workflow.graph.successor(&node.id) {
            Some(next) => Ok(ProcessorResult::advance(next.id.clone())),
            None => Ok(ProcessorResult::complete()),
        }
    }
}

/// Processor for time_delay nodes: schedule the successor in the future.
pub struct TimeDelayProcessor;

#[async_trait]
impl NodeProcessor for TimeDelayProcessor {
    async fn process(
        &self,
        node: &Node,
        ctx: &ProcessorContext<'_>,
    ) -> Result<ProcessorResult, ProcessError> {
        let NodeData::TimeDelay(config) = &node.data else {
            return Err(ProcessError::Fatal {
                message: format!("node '{}' is not a time_delay node", node.id),
            });
        };
        let resume_at = ctx.now + config.delay();
        match ctx.workflow.graph.successor(&node.id) {
            Some(next) => Ok(ProcessorResult::advance_at(next.id.clone(), resume_at)
                .with_output(json!({ "resume_at": resume_at }))),
            None => Ok(ProcessorResult::complete()),
        }
    }
}

/// Processor for conditional_split nodes: evaluate and pick a branch.
pub struct ConditionalSplitProcessor;

#[async_trait]
impl NodeProcessor for ConditionalSplitProcessor {
    async fn process(
        &self,
        node: &Node,
        ctx: &ProcessorContext<'_>,
    ) -> Result<ProcessorResult, ProcessError> {
        let NodeData::ConditionalSplit(config) = &node.data else {
            return Err(ProcessError::Fatal {
                message: format!("node '{}' is not a conditional_split node", node.id),
            });
        };

        let outcome = config.evaluate(ctx.contact, &ctx.execution.data);
        let mut data = ctx.execution.data.clone();
        data.record_branch(outcome.matched, outcome.branch.clone());

        // A branch with no outgoing edge ends the workflow for this
        // enrollment.
        let result = match ctx.workflow.graph.successor_for_handle(&node.id, &outcome.branch) {
            Some(next) => ProcessorResult::advance(next.id.clone()),
            None => ProcessorResult::complete(),
        };
        Ok(result.with_data(data).with_output(json!({
            "matched": outcome.matched,
            "branch": outcome.branch,
        })))
    }
}

/// Processor for update_status nodes: write through the contact store.
pub struct UpdateStatusProcessor {
    contacts: Arc<dyn ContactStore>,
}

impl UpdateStatusProcessor {
    #[must_use]
    pub fn new(contacts: Arc<dyn ContactStore>) -> Self {
        Self { contacts }
    }
}

#[async_trait]
impl NodeProcessor for UpdateStatusProcessor {
    async fn process(
        &self,
        node: &Node,
        ctx: &ProcessorContext<'_>,
    ) -> Result<ProcessorResult, ProcessError> {
        let NodeData::UpdateStatus(config) = &node.data else {
            return Err(ProcessError::Fatal {
                message: format!("node '{}' is not an update_status node", node.id),
            });
        };

        self.contacts
            .update_status(&ctx.contact.id, &config.status)
            .await
            .map_err(|e| ProcessError::Transient {
                message: e.to_string(),
            })?;

        let result = match ctx.workflow.graph.successor(&node.id) {
            Some(next) => ProcessorResult::advance(next.id.clone()),
            None => ProcessorResult::complete(),
        };
        Ok(result.with_output(json!({ "status": config.status })))
    }
}

/// Processor for stop_on_reply nodes: end the enrollment if a matching
/// reply was recorded, otherwise pass through.
pub struct StopOnReplyProcessor;

#[async_trait]
impl NodeProcessor for StopOnReplyProcessor {
    async fn process(
        &self,
        node: &Node,
        ctx: &ProcessorContext<'_>,
    ) -> Result<ProcessorResult, ProcessError> {
        let NodeData::StopOnReply(config) = &node.data else {
            return Err(ProcessError::Fatal {
                message: format!("node '{}' is not a stop_on_reply node", node.id),
            });
        };

        if let Some(flag) = &ctx.execution.data.stopped_by_reply {
            if config.channel.matches(flag.channel) {
                return Ok(ProcessorResult::stop(format!(
                    "contact replied via {}",
                    flag.channel.as_str()
                ))
                .with_output(json!({ "reply_channel": flag.channel })));
            }
        }

        match ctx.workflow.graph.successor(&node.id) {
            Some(next) => Ok(ProcessorResult::advance(next.id.clone())),
            None => Ok(ProcessorResult::complete()),
        }
    }
}

/// Processor for return_to_parent nodes: record the reported result and
/// complete the child enrollment.
pub struct ReturnToParentProcessor;

#[async_trait]
impl NodeProcessor for ReturnToParentProcessor {
    async fn process(
        &self,
        node: &Node,
        ctx: &ProcessorContext<'_>,
    ) -> Result<ProcessorResult, ProcessError> {
        let NodeData::ReturnToParent(config) = &node.data else {
            return Err(ProcessError::Fatal {
                message: format!("node '{}' is not a return_to_parent node", node.id),
            });
        };
        if !ctx.enrollment.is_child() {
            return Err(ProcessError::Fatal {
                message: format!(
                    "node '{}' requires a sub-workflow enrollment, but this enrollment has no parent",
                    node.id
                ),
            });
        }

        let status_value = crate::condition::evaluate_value_expression(
            &JsonValue::String(config.result_status.clone()),
            ctx.contact,
            &ctx.execution.data,
        );
        let status = match crate::condition::value_to_text(&status_value) {
            s if s.is_empty() => "success".to_string(),
            s => s,
        };

        let mut outputs = Map::new();
        for mapping in &config.outputs {
            outputs.insert(
                mapping.name.clone(),
                crate::condition::evaluate_value_expression(
                    &mapping.value,
                    ctx.contact,
                    &ctx.execution.data,
                ),
            );
        }

        let mut data = ctx.execution.data.clone();
        data.sub_workflow_result = Some(SubWorkflowResult {
            status: status.clone(),
            outputs: outputs.clone(),
        });

        Ok(ProcessorResult::complete().with_data(data).with_output(json!({
            "status": status,
            "outputs": outputs,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::MemoryContacts;
    use crate::edge::Edge;
    use crate::execution::{ReplyChannel, ReplyFlag};
    use crate::node::{
        DelayUnit, FieldMapping, ReplyChannelFilter, ReturnToParentData, StopOnReplyData,
        TimeDelayData, UpdateStatusData,
    };
    use chrono::TimeZone;

    fn linear_workflow() -> (Workflow, NodeId, NodeId) {
        let mut workflow = Workflow::new("Test");
        let start = workflow
            .graph
            .add_node(Node::with_id("start", "Start", NodeData::TriggerStart))
            .expect("add");
        let wait = workflow
            .graph
            .add_node(Node::with_id(
                "wait",
                "Wait",
                NodeData::TimeDelay(TimeDelayData {
                    duration: 1,
                    unit: DelayUnit::Days,
                }),
            ))
            .expect("add");
        workflow
            .graph
            .add_edge(&start, &wait, Edge::new())
            .expect("edge");
        (workflow, start, wait)
    }

    fn enrollment_for(workflow: &Workflow, contact: &Contact) -> WorkflowEnrollment {
        WorkflowEnrollment::new(workflow.id, contact.id)
    }

    fn execution_at(enrollment: &WorkflowEnrollment, node: &NodeId) -> WorkflowExecution {
        WorkflowExecution::new(enrollment.id, node.clone())
    }

    #[tokio::test]
    async fn trigger_advances_to_successor() {
        let (workflow, start, wait) = linear_workflow();
        let contact = Contact::new();
        let enrollment = enrollment_for(&workflow, &contact);
        let execution = execution_at(&enrollment, &start);
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now: Utc::now(),
        };

        let node = workflow.graph.get_node(&start).expect("node");
        let result = TriggerStartProcessor.process(node, &ctx).await.expect("process");
        assert_eq!(result.next_node, Some(wait));
        assert!(result.next_run_at.is_none());
    }

    #[tokio::test]
    async fn time_delay_schedules_exactly_one_day_out() {
        let (workflow, _, wait) = linear_workflow();
        let contact = Contact::new();
        let enrollment = enrollment_for(&workflow, &contact);
        let execution = execution_at(&enrollment, &wait);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now,
        };

        let node = workflow.graph.get_node(&wait).expect("node");
        let result = TimeDelayProcessor.process(node, &ctx).await.expect("process");
        // delay node with no successor completes, so give it one below;
        // here "wait" has no outgoing edge, meaning completion
        assert!(result.next_node.is_none());

        // now with a successor
        let mut workflow = Workflow::new("Test");
        let start = workflow
            .graph
            .add_node(Node::with_id("start", "Start", NodeData::TriggerStart))
            .expect("add");
        let wait = workflow
            .graph
            .add_node(Node::with_id(
                "wait",
                "Wait",
                NodeData::TimeDelay(TimeDelayData {
                    duration: 1,
                    unit: DelayUnit::Days,
                }),
            ))
            .expect("add");
        workflow.graph.add_edge(&start, &wait, Edge::new()).expect("edge");
        let done = workflow
            .graph
            .add_node(Node::with_id("done", "Done", NodeData::UpdateStatus(UpdateStatusData {
                status: "nurtured".to_string(),
            })))
            .expect("add");
        workflow.graph.add_edge(&wait, &done, Edge::new()).expect("edge");

        let enrollment = enrollment_for(&workflow, &contact);
        let execution = execution_at(&enrollment, &wait);
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now,
        };
        let node = workflow.graph.get_node(&wait).expect("node");
        let result = TimeDelayProcessor.process(node, &ctx).await.expect("process");
        assert_eq!(result.next_node, Some(done));
        assert_eq!(
            result.next_run_at,
            Some(now + chrono::Duration::seconds(86_400))
        );
    }

    #[tokio::test]
    async fn conditional_split_records_branch_in_data() {
        use crate::condition::{
            Condition, ConditionGroup, ConditionOperator, ConditionalSplitData, LogicalOperator,
        };

        let mut workflow = Workflow::new("Test");
        let split = workflow
            .graph
            .add_node(Node::with_id(
                "split",
                "Lead?",
                NodeData::ConditionalSplit(ConditionalSplitData {
                    condition_groups: vec![ConditionGroup {
                        operator: LogicalOperator::And,
                        conditions: vec![Condition {
                            field: "status".to_string(),
                            operator: ConditionOperator::Equals,
                            value: json!("lead"),
                        }],
                    }],
                    group_operator: LogicalOperator::Or,
                    multi_branch: false,
                }),
            ))
            .expect("add");
        let yes = workflow
            .graph
            .add_node(Node::with_id(
                "yes",
                "Yes",
                NodeData::UpdateStatus(UpdateStatusData {
                    status: "qualified".to_string(),
                }),
            ))
            .expect("add");
        workflow
            .graph
            .add_edge(&split, &yes, Edge::with_handle("true"))
            .expect("edge");

        let mut contact = Contact::new();
        contact.status = "lead".to_string();
        let enrollment = enrollment_for(&workflow, &contact);
        let execution = execution_at(&enrollment, &split);
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now: Utc::now(),
        };

        let node = workflow.graph.get_node(&split).expect("node");
        let result = ConditionalSplitProcessor
            .process(node, &ctx)
            .await
            .expect("process");
        assert_eq!(result.next_node, Some(yes));
        let data = result.data.expect("data updated");
        assert_eq!(data.last_condition_result, Some(true));
        assert_eq!(data.last_branch.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn conditional_split_missing_branch_completes() {
        use crate::condition::ConditionalSplitData;

        let mut workflow = Workflow::new("Test");
        let split = workflow
            .graph
            .add_node(Node::with_id(
                "split",
                "Split",
                NodeData::ConditionalSplit(ConditionalSplitData {
                    condition_groups: Vec::new(),
                    group_operator: crate::condition::LogicalOperator::Or,
                    multi_branch: false,
                }),
            ))
            .expect("add");

        let contact = Contact::new();
        let enrollment = enrollment_for(&workflow, &contact);
        let execution = execution_at(&enrollment, &split);
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now: Utc::now(),
        };

        let node = workflow.graph.get_node(&split).expect("node");
        let result = ConditionalSplitProcessor
            .process(node, &ctx)
            .await
            .expect("process");
        assert!(result.next_node.is_none());
        assert!(result.stop_reason.is_none());
    }

    #[tokio::test]
    async fn update_status_writes_through_store() {
        let mut workflow = Workflow::new("Test");
        let update = workflow
            .graph
            .add_node(Node::with_id(
                "update",
                "Mark customer",
                NodeData::UpdateStatus(UpdateStatusData {
                    status: "customer".to_string(),
                }),
            ))
            .expect("add");

        let contacts = Arc::new(MemoryContacts::new());
        let contact = Contact::new();
        let contact_id = contact.id;
        contacts.insert(contact.clone());

        let enrollment = enrollment_for(&workflow, &contact);
        let execution = execution_at(&enrollment, &update);
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now: Utc::now(),
        };

        let processor = UpdateStatusProcessor::new(contacts.clone());
        let node = workflow.graph.get_node(&update).expect("node");
        let result = processor.process(node, &ctx).await.expect("process");
        assert!(result.next_node.is_none());
        assert_eq!(contacts.status_of(&contact_id), Some("customer".to_string()));
    }

    #[tokio::test]
    async fn update_status_store_failure_is_transient() {
        let mut workflow = Workflow::new("Test");
        let update = workflow
            .graph
            .add_node(Node::with_id(
                "update",
                "Mark",
                NodeData::UpdateStatus(UpdateStatusData {
                    status: "customer".to_string(),
                }),
            ))
            .expect("add");

        // contact not inserted into the store, so the update fails
        let contacts = Arc::new(MemoryContacts::new());
        let contact = Contact::new();
        let enrollment = enrollment_for(&workflow, &contact);
        let execution = execution_at(&enrollment, &update);
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now: Utc::now(),
        };

        let processor = UpdateStatusProcessor::new(contacts);
        let node = workflow.graph.get_node(&update).expect("node");
        let err = processor.process(node, &ctx).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn stop_on_reply_stops_on_matching_channel() {
        let mut workflow = Workflow::new("Test");
        let stop = workflow
            .graph
            .add_node(Node::with_id(
                "stop",
                "Stop on SMS",
                NodeData::StopOnReply(StopOnReplyData {
                    channel: ReplyChannelFilter::Sms,
                }),
            ))
            .expect("add");
        let next = workflow
            .graph
            .add_node(Node::with_id(
                "next",
                "Next",
                NodeData::UpdateStatus(UpdateStatusData {
                    status: "replied".to_string(),
                }),
            ))
            .expect("add");
        workflow.graph.add_edge(&stop, &next, Edge::new()).expect("edge");

        let contact = Contact::new();
        let enrollment = enrollment_for(&workflow, &contact);
        let mut execution = execution_at(&enrollment, &stop);
        execution.data.set_reply(ReplyFlag {
            channel: ReplyChannel::Sms,
            received_at: Utc::now(),
        });
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now: Utc::now(),
        };

        let node = workflow.graph.get_node(&stop).expect("node");
        let result = StopOnReplyProcessor.process(node, &ctx).await.expect("process");
        assert_eq!(result.stop_reason.as_deref(), Some("contact replied via sms"));
        assert!(result.next_node.is_none());
    }

    #[tokio::test]
    async fn stop_on_reply_ignores_other_channels() {
        let mut workflow = Workflow::new("Test");
        let stop = workflow
            .graph
            .add_node(Node::with_id(
                "stop",
                "Stop on email",
                NodeData::StopOnReply(StopOnReplyData {
                    channel: ReplyChannelFilter::Email,
                }),
            ))
            .expect("add");
        let next = workflow
            .graph
            .add_node(Node::with_id(
                "next",
                "Next",
                NodeData::UpdateStatus(UpdateStatusData {
                    status: "replied".to_string(),
                }),
            ))
            .expect("add");
        workflow.graph.add_edge(&stop, &next, Edge::new()).expect("edge");

        let contact = Contact::new();
        let enrollment = enrollment_for(&workflow, &contact);
        let mut execution = execution_at(&enrollment, &stop);
        execution.data.set_reply(ReplyFlag {
            channel: ReplyChannel::Sms,
            received_at: Utc::now(),
        });
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now: Utc::now(),
        };

        let node = workflow.graph.get_node(&stop).expect("node");
        let result = StopOnReplyProcessor.process(node, &ctx).await.expect("process");
        assert!(result.stop_reason.is_none());
        assert_eq!(result.next_node, Some(next));
    }

    #[tokio::test]
    async fn return_to_parent_requires_child_enrollment() {
        let mut workflow = Workflow::new("Test");
        let ret = workflow
            .graph
            .add_node(Node::with_id(
                "ret",
                "Return",
                NodeData::ReturnToParent(ReturnToParentData {
                    result_status: "success".to_string(),
                    outputs: Vec::new(),
                }),
            ))
            .expect("add");

        let contact = Contact::new();
        let enrollment = enrollment_for(&workflow, &contact);
        let execution = execution_at(&enrollment, &ret);
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now: Utc::now(),
        };

        let node = workflow.graph.get_node(&ret).expect("node");
        let err = ReturnToParentProcessor.process(node, &ctx).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn return_to_parent_records_result_and_outputs() {
        let mut workflow = Workflow::new("Test");
        let ret = workflow
            .graph
            .add_node(Node::with_id(
                "ret",
                "Return",
                NodeData::ReturnToParent(ReturnToParentData {
                    result_status: "success".to_string(),
                    outputs: vec![FieldMapping {
                        name: "final_status".to_string(),
                        value: json!("{{status}}"),
                    }],
                }),
            ))
            .expect("add");

        let mut contact = Contact::new();
        contact.status = "customer".to_string();
        let child = WorkflowEnrollment::child_of(
            workflow.id,
            contact.id,
            cadence_core::EnrollmentId::new(),
            NodeId::from("call-1"),
        );
        let execution = execution_at(&child, &ret);
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &child,
            execution: &execution,
            contact: &contact,
            now: Utc::now(),
        };

        let node = workflow.graph.get_node(&ret).expect("node");
        let result = ReturnToParentProcessor.process(node, &ctx).await.expect("process");
        assert!(result.next_node.is_none());
        let data = result.data.expect("data updated");
        let reported = data.sub_workflow_result.expect("result recorded");
        assert_eq!(reported.status, "success");
        assert_eq!(reported.outputs.get("final_status"), Some(&json!("customer")));
    }

    #[tokio::test]
    async fn registry_lookup_by_kind() {
        let registry = ProcessorRegistry::default();
        assert!(registry.get("trigger_start").is_none());

        let mut registry = ProcessorRegistry::new();
        registry.register("trigger_start", Arc::new(TriggerStartProcessor));
        assert!(registry.get("trigger_start").is_some());
        assert!(registry.get("time_delay").is_none());
    }
}
