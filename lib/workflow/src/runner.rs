//! The step runner: drives one claimed execution cursor through its
//! current node and persists the outcome as a single step record.

use crate::contact::{ContactStore, ContactStoreError};
use crate::enrollment::{EnrollmentStatus, WorkflowEnrollment};
use crate::execution::{ExecutionLogStatus, WorkflowExecution, WorkflowExecutionLog};
use crate::node::{Node, NodeId};
use crate::processor::{ProcessorContext, ProcessorRegistry};
use crate::store::{EngineStore, StepRecord, StoreError};
use chrono::{Duration, Utc};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Exponential backoff for transient step failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_seconds: i64,
    /// Upper bound on any delay.
    pub max_seconds: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_seconds: 60,
            max_seconds: 3600,
        }
    }
}

impl RetryPolicy {
    /// Delay to apply after `attempts` failed attempts, doubling each
    /// time up to the cap.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(6);
        let seconds = self
            .base_seconds
            .saturating_mul(1_i64 << exponent)
            .min(self.max_seconds);
        Duration::seconds(seconds)
    }
}

/// Errors that abort a step before anything was persisted. The poller
/// releases the cursor so the step runs again later.
#[derive(Debug)]
pub enum RunnerError {
    Store(StoreError),
    Contact(ContactStoreError),
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(error) => error.fmt(f),
            Self::Contact(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(error) => Some(error),
            Self::Contact(error) => Some(error),
        }
    }
}

impl From<StoreError> for RunnerError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl From<ContactStoreError> for RunnerError {
    fn from(error: ContactStoreError) -> Self {
        Self::Contact(error)
    }
}

/// What one step did to its enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The cursor moved to another node (or back onto the same node for
    /// a parked sub-workflow wait).
    Advanced { node: NodeId },
    /// The enrollment finished the workflow.
    Completed,
    /// The enrollment stopped early, for example on a reply.
    Stopped,
    /// The step failed for good and took the enrollment with it.
    Failed,
    /// A transient failure; the cursor is scheduled for another attempt.
    Retrying { attempt: u32 },
    /// The enrollment had already ended; the cursor was retired.
    Skipped,
    /// The enrollment is paused; the cursor went back to the queue.
    Released,
}

/// Runs claimed execution cursors.
pub struct StepRunner {
    store: Arc<dyn EngineStore>,
    contacts: Arc<dyn ContactStore>,
    registry: Arc<ProcessorRegistry>,
    retry: RetryPolicy,
}

impl StepRunner {
    #[must_use]
    pub fn new(
        store: Arc<dyn EngineStore>,
        contacts: Arc<dyn ContactStore>,
        registry: Arc<ProcessorRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            contacts,
            registry,
            retry,
        }
    }

    /// Drives one claimed cursor to its next durable state. Exactly one
    /// step record is persisted unless the enrollment turned out to be
    /// paused, or an early store error aborts the step.
    pub async fn run(&self, mut execution: WorkflowExecution) -> Result<StepOutcome, RunnerError> {
        let now = Utc::now();
        let started = Instant::now();
        debug!(
            execution = %execution.id,
            node = %execution.current_node_id,
            attempt = execution.attempts,
            "running step"
        );

        let Some(mut enrollment) = self.store.get_enrollment(&execution.enrollment_id).await?
        else {
            let message = format!("enrollment '{}' not found", execution.enrollment_id);
            warn!(execution = %execution.id, "{message}");
            execution.fail(message.clone());
            let log = WorkflowExecutionLog::new(
                &execution,
                execution.current_node_id.clone(),
                "unknown",
                ExecutionLogStatus::Failed,
            )
            .with_error(message)
            .with_duration_ms(elapsed_ms(started));
            let record = StepRecord {
                enrollment: None,
                execution,
                log,
            };
            self.store.persist_step(&record).await?;
            return Ok(StepOutcome::Failed);
        };

        if enrollment.status == EnrollmentStatus::Paused {
            self.store.release_execution(&execution.id, now).await?;
            return Ok(StepOutcome::Released);
        }
        if enrollment.status.is_terminal() {
            // the enrollment ended while the cursor sat in the queue
            let node_type = self
                .store
                .get_workflow(&enrollment.workflow_id)
                .await?
                .and_then(|w| {
                    w.graph
                        .get_node(&execution.current_node_id)
                        .map(Node::kind)
                })
                .unwrap_or("unknown");
            execution.skip();
            let log = WorkflowExecutionLog::new(
                &execution,
                execution.current_node_id.clone(),
                node_type,
                ExecutionLogStatus::Skipped,
            )
            .with_duration_ms(elapsed_ms(started));
            let record = StepRecord {
                enrollment: None,
                execution,
                log,
            };
            self.store.persist_step(&record).await?;
            return Ok(StepOutcome::Skipped);
        }

        let Some(workflow) = self.store.get_workflow(&enrollment.workflow_id).await? else {
            let message = format!("workflow '{}' not found", enrollment.workflow_id);
            return self
                .fail_step(enrollment, execution, "unknown", message, started)
                .await;
        };
        let Some(node) = workflow.graph.get_node(&execution.current_node_id) else {
            let message = format!(
                "node '{}' not found in workflow '{}'",
                execution.current_node_id, workflow.id
            );
            return self
                .fail_step(enrollment, execution, "unknown", message, started)
                .await;
        };
        let Some(processor) = self.registry.get(node.kind()) else {
            let message = format!("no processor registered for node type '{}'", node.kind());
            return self
                .fail_step(enrollment, execution, node.kind(), message, started)
                .await;
        };
        let contact = match self.contacts.get(&enrollment.contact_id).await {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                let message = format!("contact '{}' not found", enrollment.contact_id);
                return self
                    .fail_step(enrollment, execution, node.kind(), message, started)
                    .await;
            }
            // contact store trouble aborts the step; the poller hands
            // the cursor back without burning an attempt
            Err(error) => return Err(error.into()),
        };

        let input = serde_json::to_value(&node.data).ok();
        let ctx = ProcessorContext {
            workflow: &workflow,
            enrollment: &enrollment,
            execution: &execution,
            contact: &contact,
            now,
        };
        let result = processor.process(node, &ctx).await;

        match result {
            Ok(step) => {
                if let Some(data) = step.data {
                    execution.data = data;
                }

                if let Some(reason) = step.stop_reason {
                    enrollment.stop(Some(reason));
                    execution.complete();
                    let log = outcome_log(
                        &execution,
                        node,
                        ExecutionLogStatus::Completed,
                        input,
                        step.output,
                        started,
                    );
                    let record = StepRecord {
                        enrollment: Some(enrollment),
                        execution,
                        log,
                    };
                    self.store.persist_step(&record).await?;
                    Ok(StepOutcome::Stopped)
                } else if let Some(next) = step.next_node {
                    execution.advance_to(next.clone(), step.next_run_at);
                    let log = outcome_log(
                        &execution,
                        node,
                        ExecutionLogStatus::Completed,
                        input,
                        step.output,
                        started,
                    );
                    let record = StepRecord {
                        enrollment: None,
                        execution,
                        log,
                    };
                    self.store.persist_step(&record).await?;
                    Ok(StepOutcome::Advanced { node: next })
                } else {
                    execution.complete();
                    enrollment.complete();
                    let log = outcome_log(
                        &execution,
                        node,
                        ExecutionLogStatus::Completed,
                        input,
                        step.output,
                        started,
                    );
                    let record = StepRecord {
                        enrollment: Some(enrollment),
                        execution,
                        log,
                    };
                    self.store.persist_step(&record).await?;
                    Ok(StepOutcome::Completed)
                }
            }
            Err(error) => {
                let message = error.to_string();
                if error.is_transient() && execution.attempts < execution.max_attempts {
                    let attempt = execution.attempts;
                    debug!(
                        execution = %execution.id,
                        attempt,
                        error = %message,
                        "transient step failure, scheduling retry"
                    );
                    execution.retry_at(now + self.retry.delay_for(attempt), message.clone());
                    let log =
                        outcome_log(&execution, node, ExecutionLogStatus::Failed, input, None, started)
                            .with_error(message);
                    let record = StepRecord {
                        enrollment: None,
                        execution,
                        log,
                    };
                    self.store.persist_step(&record).await?;
                    Ok(StepOutcome::Retrying { attempt })
                } else {
                    warn!(
                        execution = %execution.id,
                        node = %node.id,
                        error = %message,
                        "step failed permanently"
                    );
                    execution.fail(message.clone());
                    enrollment.fail(message.clone());
                    let log =
                        outcome_log(&execution, node, ExecutionLogStatus::Failed, input, None, started)
                            .with_error(message);
                    let record = StepRecord {
                        enrollment: Some(enrollment),
                        execution,
                        log,
                    };
                    self.store.persist_step(&record).await?;
                    Ok(StepOutcome::Failed)
                }
            }
        }
    }

    async fn fail_step(
        &self,
        mut enrollment: WorkflowEnrollment,
        mut execution: WorkflowExecution,
        node_type: &str,
        message: String,
        started: Instant,
    ) -> Result<StepOutcome, RunnerError> {
        warn!(execution = %execution.id, error = %message, "step failed permanently");
        execution.fail(message.clone());
        enrollment.fail(message.clone());
        let log = WorkflowExecutionLog::new(
            &execution,
            execution.current_node_id.clone(),
            node_type,
            ExecutionLogStatus::Failed,
        )
        .with_error(message)
        .with_duration_ms(elapsed_ms(started));
        let record = StepRecord {
            enrollment: Some(enrollment),
            execution,
            log,
        };
        self.store.persist_step(&record).await?;
        Ok(StepOutcome::Failed)
    }
}

fn outcome_log(
    execution: &WorkflowExecution,
    node: &Node,
    status: ExecutionLogStatus,
    input: Option<JsonValue>,
    output: Option<JsonValue>,
    started: Instant,
) -> WorkflowExecutionLog {
    let mut log = WorkflowExecutionLog::for_node(execution, node, status)
        .with_output(output)
        .with_duration_ms(elapsed_ms(started));
    if let Some(input) = input {
        log = log.with_input(input);
    }
    log
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{Contact, MemoryContacts};
    use crate::definition::Workflow;
    use crate::edge::Edge;
    use crate::enrollment::{EnrollmentStatus, WorkflowEnrollment};
    use crate::execution::{ExecutionStatus, ReplyChannel, ReplyFlag};
    use crate::messaging::{MemoryTemplates, MessageChannel, MessageTemplate, RecordingSender};
    use crate::node::{
        DelayUnit, Node, NodeData, ReplyChannelFilter, SendMessageData, StopOnReplyData,
        TimeDelayData, UpdateStatusData,
    };
    use crate::store::MemoryStore;
    use crate::subflow::{ChildState, StubEnroller};
    use cadence_core::TemplateId;
    use chrono::{DateTime, Utc};

    struct Engine {
        store: Arc<MemoryStore>,
        contacts: Arc<MemoryContacts>,
        templates: Arc<MemoryTemplates>,
        sender: Arc<RecordingSender>,
        enroller: Arc<StubEnroller>,
        runner: StepRunner,
    }

    fn engine_with(sender: RecordingSender, retry: RetryPolicy) -> Engine {
        let store = Arc::new(MemoryStore::new());
        let contacts = Arc::new(MemoryContacts::new());
        let templates = Arc::new(MemoryTemplates::new());
        let sender = Arc::new(sender);
        let enroller = Arc::new(StubEnroller::new());
        let registry = Arc::new(ProcessorRegistry::standard(
            contacts.clone(),
            templates.clone(),
            sender.clone(),
            enroller.clone(),
        ));
        let runner = StepRunner::new(store.clone(), contacts.clone(), registry, retry);
        Engine {
            store,
            contacts,
            templates,
            sender,
            enroller,
            runner,
        }
    }

    fn engine() -> Engine {
        // zero backoff keeps retried cursors immediately due
        engine_with(
            RecordingSender::succeeding(),
            RetryPolicy {
                base_seconds: 0,
                max_seconds: 0,
            },
        )
    }

    async fn enroll(
        engine: &Engine,
        workflow: &Workflow,
        contact: &Contact,
    ) -> (WorkflowEnrollment, WorkflowExecution) {
        engine
            .store
            .insert_workflow(workflow)
            .await
            .expect("insert workflow");
        engine.contacts.insert(contact.clone());
        let enrollment = WorkflowEnrollment::new(workflow.id, contact.id);
        let start = workflow.start_node().expect("start node").id.clone();
        let execution = WorkflowExecution::new(enrollment.id, start);
        engine
            .store
            .insert_enrollment(&enrollment, &execution)
            .await
            .expect("insert enrollment");
        (enrollment, execution)
    }

    async fn drive_at(engine: &Engine, now: DateTime<Utc>) -> Vec<StepOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..32 {
            let batch = engine.store.claim_due(now, 10).await.expect("claim");
            if batch.is_empty() {
                break;
            }
            for execution in batch {
                outcomes.push(engine.runner.run(execution).await.expect("run"));
            }
        }
        outcomes
    }

    async fn drive(engine: &Engine) -> Vec<StepOutcome> {
        // re-read the clock each pass so zero-backoff retries scheduled
        // during the loop are claimable
        let mut outcomes = Vec::new();
        for _ in 0..32 {
            let batch = engine
                .store
                .claim_due(Utc::now(), 10)
                .await
                .expect("claim");
            if batch.is_empty() {
                break;
            }
            for execution in batch {
                outcomes.push(engine.runner.run(execution).await.expect("run"));
            }
        }
        outcomes
    }

    fn linear_status_workflow() -> Workflow {
        let mut workflow = Workflow::new("Linear");
        let start = workflow
            .graph
            .add_node(Node::with_id("start", "Start", NodeData::TriggerStart))
            .expect("add");
        let update = workflow
            .graph
            .add_node(Node::with_id(
                "update",
                "Mark contacted",
                NodeData::UpdateStatus(UpdateStatusData {
                    status: "contacted".to_string(),
                }),
            ))
            .expect("add");
        workflow
            .graph
            .add_edge(&start, &update, Edge::new())
            .expect("edge");
        workflow
    }

    fn sms_workflow(template_id: TemplateId) -> Workflow {
        let mut workflow = Workflow::new("SMS");
        let start = workflow
            .graph
            .add_node(Node::with_id("start", "Start", NodeData::TriggerStart))
            .expect("add");
        let send = workflow
            .graph
            .add_node(Node::with_id(
                "send",
                "Send",
                NodeData::SendSms(SendMessageData {
                    template_id,
                    from_identity: None,
                }),
            ))
            .expect("add");
        workflow
            .graph
            .add_edge(&start, &send, Edge::new())
            .expect("edge");
        workflow
    }

    fn reachable_contact() -> Contact {
        let mut contact = Contact::new();
        contact.first_name = Some("Ada".to_string());
        contact.phone = Some("+15555550100".to_string());
        contact.email = Some("ada@example.com".to_string());
        contact
    }

    #[tokio::test]
    async fn runs_linear_workflow_to_completion() {
        let engine = engine();
        let workflow = linear_status_workflow();
        let contact = reachable_contact();
        let (enrollment, execution) = enroll(&engine, &workflow, &contact).await;

        let outcomes = drive(&engine).await;
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], StepOutcome::Advanced { .. }));
        assert_eq!(outcomes[1], StepOutcome::Completed);

        let stored = engine
            .store
            .get_enrollment(&enrollment.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EnrollmentStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(
            engine.contacts.status_of(&contact.id),
            Some("contacted".to_string())
        );

        let cursor = engine
            .store
            .get_execution(&execution.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(cursor.status, ExecutionStatus::Completed);

        let logs = engine
            .store
            .logs_for_enrollment(&enrollment.id)
            .await
            .expect("logs");
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|log| log.status == ExecutionLogStatus::Completed));
        assert_eq!(logs[0].node_type, "trigger_start");
        assert_eq!(logs[1].node_type, "update_status");
    }

    #[tokio::test]
    async fn transient_send_failures_exhaust_the_attempt_budget() {
        let engine = engine_with(
            RecordingSender::failing(true),
            RetryPolicy {
                base_seconds: 0,
                max_seconds: 0,
            },
        );
        let template_id = TemplateId::new();
        engine.templates.insert(MessageTemplate {
            id: template_id,
            name: "Follow up".to_string(),
            channel: MessageChannel::Sms,
            subject: None,
            body: "Hi {{first_name}}".to_string(),
        });
        let workflow = sms_workflow(template_id);
        let contact = reachable_contact();
        let (enrollment, execution) = enroll(&engine, &workflow, &contact).await;

        let outcomes = drive(&engine).await;
        // trigger advance, then three send attempts
        assert_eq!(
            outcomes,
            vec![
                StepOutcome::Advanced {
                    node: NodeId::from("send")
                },
                StepOutcome::Retrying { attempt: 1 },
                StepOutcome::Retrying { attempt: 2 },
                StepOutcome::Failed,
            ]
        );
        assert_eq!(engine.sender.calls().len(), 3);

        let stored = engine
            .store
            .get_enrollment(&enrollment.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EnrollmentStatus::Failed);
        assert!(stored.stop_reason.is_some());

        let cursor = engine
            .store
            .get_execution(&execution.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(cursor.status, ExecutionStatus::Failed);
        assert_eq!(cursor.attempts, 3);

        let logs = engine
            .store
            .logs_for_enrollment(&enrollment.id)
            .await
            .expect("logs");
        let failed = logs
            .iter()
            .filter(|log| log.status == ExecutionLogStatus::Failed)
            .count();
        assert_eq!(failed, 3);
    }

    #[tokio::test]
    async fn retry_is_scheduled_with_backoff() {
        let engine = engine_with(
            RecordingSender::failing(true),
            RetryPolicy {
                base_seconds: 60,
                max_seconds: 3600,
            },
        );
        let template_id = TemplateId::new();
        engine.templates.insert(MessageTemplate {
            id: template_id,
            name: "Follow up".to_string(),
            channel: MessageChannel::Sms,
            subject: None,
            body: "Hi".to_string(),
        });
        let workflow = sms_workflow(template_id);
        let contact = reachable_contact();
        let (_, execution) = enroll(&engine, &workflow, &contact).await;

        let before = Utc::now();
        let outcomes = drive(&engine).await;
        // backoff pushes the second attempt out of this drive pass
        assert_eq!(
            outcomes,
            vec![
                StepOutcome::Advanced {
                    node: NodeId::from("send")
                },
                StepOutcome::Retrying { attempt: 1 },
            ]
        );

        let cursor = engine
            .store
            .get_execution(&execution.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(cursor.status, ExecutionStatus::Waiting);
        assert_eq!(cursor.attempts, 1);
        let due = cursor.next_run_at.expect("scheduled");
        assert!(due >= before + Duration::seconds(60));
        assert!(cursor.error_message.is_some());
    }

    #[tokio::test]
    async fn time_delay_parks_the_cursor_until_due() {
        let engine = engine();
        let mut workflow = Workflow::new("Delayed");
        let start = workflow
            .graph
            .add_node(Node::with_id("start", "Start", NodeData::TriggerStart))
            .expect("add");
        let wait = workflow
            .graph
            .add_node(Node::with_id(
                "wait",
                "Wait a day",
                NodeData::TimeDelay(TimeDelayData {
                    duration: 1,
                    unit: DelayUnit::Days,
                }),
            ))
            .expect("add");
        let update = workflow
            .graph
            .add_node(Node::with_id(
                "update",
                "Mark",
                NodeData::UpdateStatus(UpdateStatusData {
                    status: "nurtured".to_string(),
                }),
            ))
            .expect("add");
        workflow.graph.add_edge(&start, &wait, Edge::new()).expect("edge");
        workflow.graph.add_edge(&wait, &update, Edge::new()).expect("edge");

        let contact = reachable_contact();
        let (enrollment, execution) = enroll(&engine, &workflow, &contact).await;

        drive(&engine).await;
        let cursor = engine
            .store
            .get_execution(&execution.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(cursor.status, ExecutionStatus::Waiting);
        assert_eq!(cursor.current_node_id, NodeId::from("update"));
        let due = cursor.next_run_at.expect("scheduled");
        assert!(due > Utc::now() + Duration::hours(23));

        // nothing to claim before the delay elapses
        assert!(drive(&engine).await.is_empty());

        let outcomes = drive_at(&engine, due + Duration::seconds(1)).await;
        assert_eq!(outcomes, vec![StepOutcome::Completed]);
        let stored = engine
            .store
            .get_enrollment(&enrollment.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn reply_flag_stops_the_enrollment_at_the_stop_node() {
        let engine = engine();
        let template_id = TemplateId::new();
        engine.templates.insert(MessageTemplate {
            id: template_id,
            name: "Follow up".to_string(),
            channel: MessageChannel::Sms,
            subject: None,
            body: "Hi".to_string(),
        });

        let mut workflow = Workflow::new("Stop on reply");
        let start = workflow
            .graph
            .add_node(Node::with_id("start", "Start", NodeData::TriggerStart))
            .expect("add");
        let stop = workflow
            .graph
            .add_node(Node::with_id(
                "stop",
                "Stop on reply",
                NodeData::StopOnReply(StopOnReplyData {
                    channel: ReplyChannelFilter::Any,
                }),
            ))
            .expect("add");
        let send = workflow
            .graph
            .add_node(Node::with_id(
                "send",
                "Send",
                NodeData::SendSms(SendMessageData {
                    template_id,
                    from_identity: None,
                }),
            ))
            .expect("add");
        workflow.graph.add_edge(&start, &stop, Edge::new()).expect("edge");
        workflow.graph.add_edge(&stop, &send, Edge::new()).expect("edge");

        let contact = reachable_contact();
        let (enrollment, execution) = enroll(&engine, &workflow, &contact).await;

        // the contact replies before the sequence reaches the stop node
        assert!(
            engine
                .store
                .flag_reply(
                    &execution.id,
                    &ReplyFlag {
                        channel: ReplyChannel::Sms,
                        received_at: Utc::now(),
                    },
                )
                .await
                .expect("flag")
        );

        let outcomes = drive(&engine).await;
        assert_eq!(
            outcomes,
            vec![
                StepOutcome::Advanced {
                    node: NodeId::from("stop")
                },
                StepOutcome::Stopped,
            ]
        );
        assert!(engine.sender.calls().is_empty());

        let stored = engine
            .store
            .get_enrollment(&enrollment.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EnrollmentStatus::Stopped);
        assert_eq!(stored.stop_reason.as_deref(), Some("contact replied via sms"));
    }

    #[tokio::test]
    async fn sync_sub_workflow_wait_does_not_consume_attempts() {
        use crate::node::{CallMode, CallSubWorkflowData, OnFailure};

        let engine = engine();
        let child_workflow_id = cadence_core::WorkflowId::new();
        let mut workflow = Workflow::new("Caller");
        let start = workflow
            .graph
            .add_node(Node::with_id("start", "Start", NodeData::TriggerStart))
            .expect("add");
        let call = workflow
            .graph
            .add_node(Node::with_id(
                "call",
                "Call child",
                NodeData::CallSubWorkflow(CallSubWorkflowData {
                    workflow_id: child_workflow_id,
                    mode: CallMode::Sync,
                    inputs: Vec::new(),
                    timeout_seconds: 3600,
                    on_failure: OnFailure::Stop,
                    retry_count: 1,
                }),
            ))
            .expect("add");
        let update = workflow
            .graph
            .add_node(Node::with_id(
                "update",
                "Mark",
                NodeData::UpdateStatus(UpdateStatusData {
                    status: "done".to_string(),
                }),
            ))
            .expect("add");
        workflow.graph.add_edge(&start, &call, Edge::new()).expect("edge");
        workflow.graph.add_edge(&call, &update, Edge::new()).expect("edge");

        let contact = reachable_contact();
        let (enrollment, execution) = enroll(&engine, &workflow, &contact).await;

        // first pass: trigger, then the call parks on itself
        drive(&engine).await;

        // three more poll cycles while the child stays active
        for _ in 0..3 {
            engine
                .store
                .with_execution_mut(&execution.id, |x| x.next_run_at = Some(Utc::now()));
            drive(&engine).await;
            let cursor = engine
                .store
                .get_execution(&execution.id)
                .await
                .expect("get")
                .expect("present");
            assert_eq!(cursor.status, ExecutionStatus::Waiting);
            assert_eq!(cursor.current_node_id, NodeId::from("call"));
            // advancing back onto the node resets the budget every poll
            assert_eq!(cursor.attempts, 0);
        }

        // the child finishes and the parent resumes past the call
        let child_id = engine.enroller.last_child().expect("child started");
        engine.enroller.set_child_state(
            child_id,
            ChildState {
                status: EnrollmentStatus::Completed,
                stop_reason: None,
                result: None,
            },
        );
        engine
            .store
            .with_execution_mut(&execution.id, |x| x.next_run_at = Some(Utc::now()));
        drive(&engine).await;

        let stored = engine
            .store
            .get_enrollment(&enrollment.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EnrollmentStatus::Completed);
        assert_eq!(engine.enroller.calls().len(), 1);
    }

    #[tokio::test]
    async fn stopped_enrollment_skips_its_queued_step() {
        let engine = engine();
        let workflow = linear_status_workflow();
        let contact = reachable_contact();
        let (enrollment, execution) = enroll(&engine, &workflow, &contact).await;

        let claimed = engine
            .store
            .claim_due(Utc::now(), 1)
            .await
            .expect("claim");
        let cursor = claimed.into_iter().next().expect("claimed");

        // the enrollment is stopped while the step is in flight
        let mut stopped = enrollment.clone();
        assert!(stopped.stop(Some("operator request".to_string())));
        assert!(engine.store.update_enrollment(&stopped).await.expect("update"));

        let outcome = engine.runner.run(cursor).await.expect("run");
        assert_eq!(outcome, StepOutcome::Skipped);

        let stored = engine
            .store
            .get_execution(&execution.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, ExecutionStatus::Skipped);
        assert_eq!(
            engine.contacts.status_of(&contact.id),
            Some("new".to_string())
        );

        let logs = engine
            .store
            .logs_for_enrollment(&enrollment.id)
            .await
            .expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ExecutionLogStatus::Skipped);
    }

    #[tokio::test]
    async fn paused_enrollment_releases_the_claimed_step() {
        let engine = engine();
        let workflow = linear_status_workflow();
        let contact = reachable_contact();
        let (enrollment, execution) = enroll(&engine, &workflow, &contact).await;

        let claimed = engine
            .store
            .claim_due(Utc::now(), 1)
            .await
            .expect("claim");
        let cursor = claimed.into_iter().next().expect("claimed");

        let mut paused = enrollment.clone();
        assert!(paused.pause());
        assert!(engine.store.update_enrollment(&paused).await.expect("update"));

        let outcome = engine.runner.run(cursor).await.expect("run");
        assert_eq!(outcome, StepOutcome::Released);

        let stored = engine
            .store
            .get_execution(&execution.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, ExecutionStatus::Waiting);
        assert_eq!(stored.attempts, 0);

        // paused enrollments are not claimable
        assert!(drive(&engine).await.is_empty());

        let logs = engine
            .store
            .logs_for_enrollment(&enrollment.id)
            .await
            .expect("logs");
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn missing_workflow_fails_the_enrollment() {
        let engine = engine();
        let contact = reachable_contact();
        engine.contacts.insert(contact.clone());

        // enrollment references a workflow that was never stored
        let enrollment = WorkflowEnrollment::new(cadence_core::WorkflowId::new(), contact.id);
        let execution = WorkflowExecution::new(enrollment.id, NodeId::from("start"));
        engine
            .store
            .insert_enrollment(&enrollment, &execution)
            .await
            .expect("insert");

        let outcomes = drive(&engine).await;
        assert_eq!(outcomes, vec![StepOutcome::Failed]);

        let stored = engine
            .store
            .get_enrollment(&enrollment.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EnrollmentStatus::Failed);
        assert!(
            stored
                .stop_reason
                .as_deref()
                .is_some_and(|reason| reason.contains("not found"))
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::seconds(60));
        assert_eq!(policy.delay_for(2), Duration::seconds(120));
        assert_eq!(policy.delay_for(3), Duration::seconds(240));
        assert_eq!(policy.delay_for(7), Duration::seconds(3600));
        assert_eq!(policy.delay_for(100), Duration::seconds(3600));
    }
}
