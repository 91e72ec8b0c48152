//! Durable engine state: workflow definitions, enrollments, execution
//! cursors, and the append-only execution log.
//!
//! The claim operation is the engine's concurrency point. A cursor is
//! handed to exactly one claimer per due cycle; everything a step
//! writes back goes through [`EngineStore::persist_step`] as one unit.

use crate::definition::Workflow;
use crate::enrollment::{EnrollmentStatus, WorkflowEnrollment};
use crate::execution::{
    ExecutionStatus, ReplyFlag, WorkflowExecution, WorkflowExecutionLog,
};
use crate::node::NodeId;
use async_trait::async_trait;
use cadence_core::{ContactId, EnrollmentId, ExecutionId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Errors from the engine store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    message: String,
}

impl StoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine store error: {}", self.message)
    }
}

impl std::error::Error for StoreError {}

/// Enrollment counts per status for one workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub active: u64,
    pub paused: u64,
    pub completed: u64,
    pub stopped: u64,
    pub failed: u64,
}

impl StatusCounts {
    /// Folds one enrollment (or one counted row) into the totals.
    pub fn add(&mut self, status: EnrollmentStatus, count: u64) {
        match status {
            EnrollmentStatus::Active => self.active += count,
            EnrollmentStatus::Paused => self.paused += count,
            EnrollmentStatus::Completed => self.completed += count,
            EnrollmentStatus::Stopped => self.stopped += count,
            EnrollmentStatus::Failed => self.failed += count,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.active + self.paused + self.completed + self.stopped + self.failed
    }
}

/// Everything one step writes back. Persisted as a unit.
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// Updated enrollment, when the step changed it.
    pub enrollment: Option<WorkflowEnrollment>,
    /// The cursor after the step.
    pub execution: WorkflowExecution,
    /// The audit row for the attempt.
    pub log: WorkflowExecutionLog,
}

/// Storage seam for the workflow engine.
#[async_trait]
pub trait EngineStore: Send + Sync {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>, StoreError>;

    /// Inserts an enrollment together with its execution cursor.
    async fn insert_enrollment(
        &self,
        enrollment: &WorkflowEnrollment,
        execution: &WorkflowExecution,
    ) -> Result<(), StoreError>;

    async fn get_enrollment(
        &self,
        id: &EnrollmentId,
    ) -> Result<Option<WorkflowEnrollment>, StoreError>;

    /// Writes an enrollment back. Returns false when the stored copy is
    /// already terminal; terminal enrollments never change again.
    async fn update_enrollment(
        &self,
        enrollment: &WorkflowEnrollment,
    ) -> Result<bool, StoreError>;

    /// Finds a non-terminal enrollment of the contact in the workflow.
    async fn find_active_enrollment(
        &self,
        workflow_id: &WorkflowId,
        contact_id: &ContactId,
    ) -> Result<Option<WorkflowEnrollment>, StoreError>;

    /// All active enrollments of a contact, across workflows.
    async fn active_enrollments_for_contact(
        &self,
        contact_id: &ContactId,
    ) -> Result<Vec<WorkflowEnrollment>, StoreError>;

    /// The most recently started child of a parent enrollment's call
    /// node.
    async fn latest_child_enrollment(
        &self,
        parent_enrollment_id: &EnrollmentId,
        parent_node_id: &NodeId,
    ) -> Result<Option<WorkflowEnrollment>, StoreError>;

    async fn status_counts(&self, workflow_id: &WorkflowId) -> Result<StatusCounts, StoreError>;

    async fn get_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    async fn execution_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Atomically claims up to `limit` due cursors whose enrollment is
    /// active, moving each waiting -> processing. A cursor is returned
    /// to exactly one claimer. Cursors with no `next_run_at` come first,
    /// then oldest due time.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Returns a claimed cursor to the queue without consuming an
    /// attempt. Returns false unless the cursor is processing.
    async fn release_execution(
        &self,
        id: &ExecutionId,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Retires an enrollment's waiting cursor. A processing cursor is
    /// left alone; the in-flight step observes the enrollment's new
    /// status when it persists.
    async fn skip_idle_execution(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<bool, StoreError>;

    /// Persists the outcome of one step: the enrollment update (if any),
    /// the cursor, and the log row. A reply flag written to the stored
    /// cursor while the step was in flight survives the write.
    async fn persist_step(&self, record: &StepRecord) -> Result<(), StoreError>;

    /// Records an inbound reply on a live cursor. Returns false when the
    /// cursor already carries a flag or is no longer live; the first
    /// reply wins.
    async fn flag_reply(
        &self,
        execution_id: &ExecutionId,
        flag: &ReplyFlag,
    ) -> Result<bool, StoreError>;

    /// Log rows for an enrollment, oldest first.
    async fn logs_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Vec<WorkflowExecutionLog>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    workflows: HashMap<WorkflowId, Workflow>,
    enrollments: HashMap<EnrollmentId, WorkflowEnrollment>,
    executions: HashMap<ExecutionId, WorkflowExecution>,
    logs: Vec<WorkflowExecutionLog>,
}

/// In-memory engine store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutates a stored execution in place. Lets tests rewind
    /// timestamps without going through the claim cycle.
    pub fn with_execution_mut(
        &self,
        id: &ExecutionId,
        mutate: impl FnOnce(&mut WorkflowExecution),
    ) {
        if let Some(execution) = self.lock().executions.get_mut(id) {
            mutate(execution);
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.lock().workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>, StoreError> {
        Ok(self.lock().workflows.get(id).cloned())
    }

    async fn insert_enrollment(
        &self,
        enrollment: &WorkflowEnrollment,
        execution: &WorkflowExecution,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.enrollments.insert(enrollment.id, enrollment.clone());
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_enrollment(
        &self,
        id: &EnrollmentId,
    ) -> Result<Option<WorkflowEnrollment>, StoreError> {
        Ok(self.lock().enrollments.get(id).cloned())
    }

    async fn update_enrollment(
        &self,
        enrollment: &WorkflowEnrollment,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(existing) = state.enrollments.get_mut(&enrollment.id) else {
            return Ok(false);
        };
        if existing.status.is_terminal() {
            return Ok(false);
        }
        *existing = enrollment.clone();
        Ok(true)
    }

    async fn find_active_enrollment(
        &self,
        workflow_id: &WorkflowId,
        contact_id: &ContactId,
    ) -> Result<Option<WorkflowEnrollment>, StoreError> {
        Ok(self
            .lock()
            .enrollments
            .values()
            .find(|e| {
                e.workflow_id == *workflow_id
                    && e.contact_id == *contact_id
                    && !e.status.is_terminal()
            })
            .cloned())
    }

    async fn active_enrollments_for_contact(
        &self,
        contact_id: &ContactId,
    ) -> Result<Vec<WorkflowEnrollment>, StoreError> {
        Ok(self
            .lock()
            .enrollments
            .values()
            .filter(|e| e.contact_id == *contact_id && e.status == EnrollmentStatus::Active)
            .cloned()
            .collect())
    }

    async fn latest_child_enrollment(
        &self,
        parent_enrollment_id: &EnrollmentId,
        parent_node_id: &NodeId,
    ) -> Result<Option<WorkflowEnrollment>, StoreError> {
        Ok(self
            .lock()
            .enrollments
            .values()
            .filter(|e| {
                e.parent_enrollment_id.as_ref() == Some(parent_enrollment_id)
                    && e.parent_node_id.as_ref() == Some(parent_node_id)
            })
            .max_by_key(|e| e.enrolled_at)
            .cloned())
    }

    async fn status_counts(&self, workflow_id: &WorkflowId) -> Result<StatusCounts, StoreError> {
        let mut counts = StatusCounts::default();
        for enrollment in self.lock().enrollments.values() {
            if enrollment.workflow_id == *workflow_id {
                counts.add(enrollment.status, 1);
            }
        }
        Ok(counts)
    }

    async fn get_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.lock().executions.get(id).cloned())
    }

    async fn execution_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self
            .lock()
            .executions
            .values()
            .find(|x| x.enrollment_id == *enrollment_id)
            .cloned())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut state = self.lock();
        let mut due: Vec<(Option<DateTime<Utc>>, ExecutionId)> = state
            .executions
            .values()
            .filter(|x| x.is_due(now))
            .filter(|x| {
                state
                    .enrollments
                    .get(&x.enrollment_id)
                    .is_some_and(|e| e.status == EnrollmentStatus::Active)
            })
            .map(|x| (x.next_run_at, x.id))
            .collect();
        due.sort_by_key(|(next_run_at, _)| *next_run_at);
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(execution) = state.executions.get_mut(&id) {
                execution.begin_attempt(now);
                claimed.push(execution.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_execution(
        &self,
        id: &ExecutionId,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(execution) = state.executions.get_mut(id) else {
            return Ok(false);
        };
        if execution.status != ExecutionStatus::Processing {
            return Ok(false);
        }
        execution.release(next_run_at);
        Ok(true)
    }

    async fn skip_idle_execution(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(execution) = state
            .executions
            .values_mut()
            .find(|x| x.enrollment_id == *enrollment_id)
        else {
            return Ok(false);
        };
        if execution.status != ExecutionStatus::Waiting {
            return Ok(false);
        }
        execution.skip();
        Ok(true)
    }

    async fn persist_step(&self, record: &StepRecord) -> Result<(), StoreError> {
        let mut state = self.lock();

        if let Some(enrollment) = &record.enrollment {
            if let Some(existing) = state.enrollments.get_mut(&enrollment.id) {
                if !existing.status.is_terminal() {
                    *existing = enrollment.clone();
                }
            }
        }

        let mut execution = record.execution.clone();
        if execution.data.stopped_by_reply.is_none() {
            if let Some(flag) = state
                .executions
                .get(&execution.id)
                .and_then(|existing| existing.data.stopped_by_reply.clone())
            {
                execution.data.stopped_by_reply = Some(flag);
            }
        }
        state.executions.insert(execution.id, execution);

        state.logs.push(record.log.clone());
        Ok(())
    }

    async fn flag_reply(
        &self,
        execution_id: &ExecutionId,
        flag: &ReplyFlag,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(execution) = state.executions.get_mut(execution_id) else {
            return Ok(false);
        };
        if execution.data.stopped_by_reply.is_some() {
            return Ok(false);
        }
        if !matches!(
            execution.status,
            ExecutionStatus::Waiting | ExecutionStatus::Processing
        ) {
            return Ok(false);
        }
        execution.data.stopped_by_reply = Some(flag.clone());
        execution.updated_at = Utc::now();
        Ok(true)
    }

    async fn logs_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Vec<WorkflowExecutionLog>, StoreError> {
        let mut logs: Vec<WorkflowExecutionLog> = self
            .lock()
            .logs
            .iter()
            .filter(|log| log.enrollment_id == *enrollment_id)
            .cloned()
            .collect();
        logs.sort_by_key(|log| log.created_at);
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionLogStatus, ReplyChannel};
    use crate::node::{Node, NodeData};
    use chrono::Duration;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn seeded_workflow() -> Workflow {
        let mut workflow = Workflow::new("Seeded");
        workflow
            .graph
            .add_node(Node::with_id("start", "Start", NodeData::TriggerStart))
            .expect("add");
        workflow
    }

    async fn seed_enrollment(
        store: &MemoryStore,
        workflow: &Workflow,
    ) -> (WorkflowEnrollment, WorkflowExecution) {
        let enrollment = WorkflowEnrollment::new(workflow.id, cadence_core::ContactId::new());
        let execution = WorkflowExecution::new(enrollment.id, NodeId::from("start"));
        store
            .insert_enrollment(&enrollment, &execution)
            .await
            .expect("insert");
        (enrollment, execution)
    }

    #[tokio::test]
    async fn claims_each_cursor_exactly_once() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");
        seed_enrollment(&store, &workflow).await;
        seed_enrollment(&store, &workflow).await;

        let now = Utc::now();
        let first = store.claim_due(now, 10).await.expect("claim");
        assert_eq!(first.len(), 2);
        for execution in &first {
            assert_eq!(execution.status, ExecutionStatus::Processing);
            assert_eq!(execution.attempts, 1);
        }

        let second = store.claim_due(now, 10).await.expect("claim");
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_cursor() {
        let store = Arc::new(MemoryStore::new());
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");
        for _ in 0..20 {
            seed_enrollment(&store, &workflow).await;
        }

        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_due(now, 3).await.expect("claim");
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|x| x.id));
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.expect("join"));
        }
        let distinct: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(distinct.len(), 20);
    }

    #[tokio::test]
    async fn claim_skips_inactive_enrollments_and_future_cursors() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");

        let (mut paused, _) = seed_enrollment(&store, &workflow).await;
        paused.pause();
        assert!(store.update_enrollment(&paused).await.expect("update"));

        let (_, future) = seed_enrollment(&store, &workflow).await;
        let later = Utc::now() + Duration::hours(1);
        store.with_execution_mut(&future.id, |x| x.next_run_at = Some(later));

        let (_, due) = seed_enrollment(&store, &workflow).await;

        let claimed = store.claim_due(Utc::now(), 10).await.expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
    }

    #[tokio::test]
    async fn claim_orders_unscheduled_cursors_first() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");

        let now = Utc::now();
        let (_, oldest) = seed_enrollment(&store, &workflow).await;
        store.with_execution_mut(&oldest.id, |x| {
            x.next_run_at = Some(now - Duration::minutes(10));
        });
        let (_, newer) = seed_enrollment(&store, &workflow).await;
        store.with_execution_mut(&newer.id, |x| {
            x.next_run_at = Some(now - Duration::minutes(1));
        });
        let (_, unscheduled) = seed_enrollment(&store, &workflow).await;
        store.with_execution_mut(&unscheduled.id, |x| x.next_run_at = None);

        let claimed = store.claim_due(now, 2).await.expect("claim");
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, unscheduled.id);
        assert_eq!(claimed[1].id, oldest.id);
    }

    #[tokio::test]
    async fn terminal_enrollment_never_changes_again() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");
        let (enrollment, _) = seed_enrollment(&store, &workflow).await;

        let mut completed = enrollment.clone();
        assert!(completed.complete());
        assert!(store.update_enrollment(&completed).await.expect("update"));

        // a stale copy cannot resurrect the enrollment
        let mut stale = enrollment;
        stale.stop(Some("late stop".to_string()));
        assert!(!store.update_enrollment(&stale).await.expect("update"));

        let stored = store
            .get_enrollment(&completed.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn reply_flag_survives_in_flight_step() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");
        seed_enrollment(&store, &workflow).await;

        let now = Utc::now();
        let claimed = store.claim_due(now, 1).await.expect("claim");
        let mut stepping = claimed.into_iter().next().expect("one claimed");

        // a reply lands while the step is processing
        let flagged = store
            .flag_reply(
                &stepping.id,
                &ReplyFlag {
                    channel: ReplyChannel::Sms,
                    received_at: now,
                },
            )
            .await
            .expect("flag");
        assert!(flagged);

        // the step finishes with a copy that predates the flag
        stepping.advance_to(NodeId::from("next"), None);
        let log = WorkflowExecutionLog::new(
            &stepping,
            NodeId::from("start"),
            "trigger_start",
            ExecutionLogStatus::Completed,
        );
        store
            .persist_step(&StepRecord {
                enrollment: None,
                execution: stepping.clone(),
                log,
            })
            .await
            .expect("persist");

        let stored = store
            .get_execution(&stepping.id)
            .await
            .expect("get")
            .expect("present");
        assert!(stored.data.stopped_by_reply.is_some());
    }

    #[tokio::test]
    async fn first_reply_wins() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");
        let (_, execution) = seed_enrollment(&store, &workflow).await;

        let sms = ReplyFlag {
            channel: ReplyChannel::Sms,
            received_at: Utc::now(),
        };
        let email = ReplyFlag {
            channel: ReplyChannel::Email,
            received_at: Utc::now(),
        };
        assert!(store.flag_reply(&execution.id, &sms).await.expect("flag"));
        assert!(!store.flag_reply(&execution.id, &email).await.expect("flag"));

        let stored = store
            .get_execution(&execution.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(
            stored.data.stopped_by_reply.map(|flag| flag.channel),
            Some(ReplyChannel::Sms)
        );
    }

    #[tokio::test]
    async fn reply_flag_rejected_on_finished_cursor() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");
        let (_, execution) = seed_enrollment(&store, &workflow).await;
        store.with_execution_mut(&execution.id, |x| x.complete());

        let flag = ReplyFlag {
            channel: ReplyChannel::Sms,
            received_at: Utc::now(),
        };
        assert!(!store.flag_reply(&execution.id, &flag).await.expect("flag"));
    }

    #[tokio::test]
    async fn release_refunds_the_attempt() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");
        seed_enrollment(&store, &workflow).await;

        let now = Utc::now();
        let claimed = store.claim_due(now, 1).await.expect("claim");
        let execution = &claimed[0];
        assert_eq!(execution.attempts, 1);

        let later = now + Duration::minutes(1);
        assert!(
            store
                .release_execution(&execution.id, later)
                .await
                .expect("release")
        );

        let stored = store
            .get_execution(&execution.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, ExecutionStatus::Waiting);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.next_run_at, Some(later));

        // not claimable again until the release time
        assert!(store.claim_due(now, 1).await.expect("claim").is_empty());
    }

    #[tokio::test]
    async fn skip_idle_leaves_processing_cursors_alone() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");
        let (enrollment, execution) = seed_enrollment(&store, &workflow).await;

        let now = Utc::now();
        let claimed = store.claim_due(now, 1).await.expect("claim");
        assert_eq!(claimed.len(), 1);

        // in flight: the skip must not race the runner
        assert!(
            !store
                .skip_idle_execution(&enrollment.id)
                .await
                .expect("skip")
        );

        assert!(
            store
                .release_execution(&execution.id, now)
                .await
                .expect("release")
        );
        assert!(
            store
                .skip_idle_execution(&enrollment.id)
                .await
                .expect("skip")
        );

        let stored = store
            .get_execution(&execution.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, ExecutionStatus::Skipped);
    }

    #[tokio::test]
    async fn latest_child_is_the_newest_enrollment() {
        let store = MemoryStore::new();
        let parent_id = cadence_core::EnrollmentId::new();
        let node = NodeId::from("call");
        let workflow_id = cadence_core::WorkflowId::new();
        let contact_id = cadence_core::ContactId::new();

        let mut older =
            WorkflowEnrollment::child_of(workflow_id, contact_id, parent_id, node.clone());
        older.enrolled_at = Utc::now() - Duration::hours(1);
        let newer = WorkflowEnrollment::child_of(workflow_id, contact_id, parent_id, node.clone());

        let older_exec = WorkflowExecution::new(older.id, NodeId::from("start"));
        let newer_exec = WorkflowExecution::new(newer.id, NodeId::from("start"));
        store
            .insert_enrollment(&older, &older_exec)
            .await
            .expect("insert");
        store
            .insert_enrollment(&newer, &newer_exec)
            .await
            .expect("insert");

        let latest = store
            .latest_child_enrollment(&parent_id, &node)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(latest.id, newer.id);
    }

    #[tokio::test]
    async fn status_counts_by_workflow() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");

        seed_enrollment(&store, &workflow).await;
        let (mut completed, _) = seed_enrollment(&store, &workflow).await;
        completed.complete();
        store.update_enrollment(&completed).await.expect("update");
        let (mut stopped, _) = seed_enrollment(&store, &workflow).await;
        stopped.stop(None);
        store.update_enrollment(&stopped).await.expect("update");

        let counts = store.status_counts(&workflow.id).await.expect("counts");
        assert_eq!(counts.active, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.stopped, 1);
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn logs_returned_oldest_first() {
        let store = MemoryStore::new();
        let workflow = seeded_workflow();
        store.insert_workflow(&workflow).await.expect("insert");
        let (enrollment, execution) = seed_enrollment(&store, &workflow).await;

        let mut first = WorkflowExecutionLog::new(
            &execution,
            NodeId::from("start"),
            "trigger_start",
            ExecutionLogStatus::Completed,
        );
        first.created_at = Utc::now() - Duration::minutes(2);
        let second = WorkflowExecutionLog::new(
            &execution,
            NodeId::from("wait"),
            "time_delay",
            ExecutionLogStatus::Completed,
        );

        // insert newest first to prove ordering is by time, not arrival
        store
            .persist_step(&StepRecord {
                enrollment: None,
                execution: execution.clone(),
                log: second.clone(),
            })
            .await
            .expect("persist");
        store
            .persist_step(&StepRecord {
                enrollment: None,
                execution: execution.clone(),
                log: first.clone(),
            })
            .await
            .expect("persist");

        let logs = store
            .logs_for_enrollment(&enrollment.id)
            .await
            .expect("logs");
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].id, first.id);
        assert_eq!(logs[1].id, second.id);
    }
}
