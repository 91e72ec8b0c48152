//! Polling loop that claims due execution cursors and hands each to the
//! step runner.

use cadence_workflow::runner::{StepOutcome, StepRunner};
use cadence_workflow::store::EngineStore;
use chrono::Duration as ChronoDuration;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// How long an errored cursor waits before the queue offers it again.
const ERROR_RELEASE_SECONDS: i64 = 30;

/// Tuning for the polling loop.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between polls.
    pub interval: Duration,
    /// Maximum cursors claimed per poll.
    pub batch_size: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 25,
        }
    }
}

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    pub advanced: usize,
    pub completed: usize,
    pub stopped: usize,
    pub failed: usize,
    pub retried: usize,
    pub skipped: usize,
    pub released: usize,
    /// Steps that errored before reaching a durable outcome.
    pub errors: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: &StepOutcome) {
        match outcome {
            StepOutcome::Advanced { .. } => self.advanced += 1,
            StepOutcome::Completed => self.completed += 1,
            StepOutcome::Stopped => self.stopped += 1,
            StepOutcome::Failed => self.failed += 1,
            StepOutcome::Retrying { .. } => self.retried += 1,
            StepOutcome::Skipped => self.skipped += 1,
            StepOutcome::Released => self.released += 1,
        }
    }

    fn is_idle(&self) -> bool {
        self.claimed == 0 && self.errors == 0
    }
}

/// Claims batches of due cursors on an interval and runs each one.
pub struct Poller {
    store: Arc<dyn EngineStore>,
    runner: Arc<StepRunner>,
    config: PollerConfig,
    shutdown: Arc<Notify>,
}

impl Poller {
    #[must_use]
    pub fn new(
        store: Arc<dyn EngineStore>,
        runner: Arc<StepRunner>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            runner,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle that stops the loop after the in-flight poll finishes.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Runs the loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "poller started"
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    if !summary.is_idle() {
                        debug!(?summary, "poll finished");
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("poller stopping");
                    return;
                }
            }
        }
    }

    /// Claims one batch of due cursors and runs each to its next durable
    /// state. Step errors are isolated: the cursor goes back to the
    /// queue with a delay and the rest of the batch continues.
    pub async fn tick(&self) -> TickSummary {
        let now = Utc::now();
        let mut summary = TickSummary::default();
        let batch = match self.store.claim_due(now, self.config.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                error!(%err, "claim failed");
                summary.errors += 1;
                return summary;
            }
        };
        summary.claimed = batch.len();

        for execution in batch {
            let execution_id = execution.id;
            match self.runner.run(execution).await {
                Ok(outcome) => summary.record(&outcome),
                Err(err) => {
                    error!(execution = %execution_id, %err, "step errored");
                    summary.errors += 1;
                    let retry_at = now + ChronoDuration::seconds(ERROR_RELEASE_SECONDS);
                    if let Err(release_err) =
                        self.store.release_execution(&execution_id, retry_at).await
                    {
                        error!(execution = %execution_id, %release_err, "release failed");
                    }
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::ContactId;
    use cadence_workflow::contact::{Contact, ContactStore, ContactStoreError, MemoryContacts};
    use cadence_workflow::definition::Workflow;
    use cadence_workflow::edge::Edge;
    use cadence_workflow::enrollment::{EnrollmentStatus, WorkflowEnrollment};
    use cadence_workflow::execution::{ExecutionStatus, WorkflowExecution};
    use cadence_workflow::messaging::{MemoryTemplates, RecordingSender};
    use cadence_workflow::node::{Node, NodeData, NodeId, UpdateStatusData};
    use cadence_workflow::processor::ProcessorRegistry;
    use cadence_workflow::runner::RetryPolicy;
    use cadence_workflow::store::{EngineStore, MemoryStore};
    use cadence_workflow::subflow::StubEnroller;

    fn poller_for(store: Arc<MemoryStore>, contacts: Arc<dyn ContactStore>) -> Poller {
        let registry = Arc::new(ProcessorRegistry::standard(
            contacts.clone(),
            Arc::new(MemoryTemplates::new()),
            Arc::new(RecordingSender::succeeding()),
            Arc::new(StubEnroller::new()),
        ));
        let runner = Arc::new(StepRunner::new(
            store.clone(),
            contacts,
            registry,
            RetryPolicy {
                base_seconds: 0,
                max_seconds: 0,
            },
        ));
        Poller::new(
            store,
            runner,
            PollerConfig {
                interval: Duration::from_millis(5),
                batch_size: 10,
            },
        )
    }

    fn two_step_workflow() -> Workflow {
        let mut workflow = Workflow::new("Tick");
        let start = workflow
            .graph
            .add_node(Node::with_id("start", "Start", NodeData::TriggerStart))
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
        workflow
            .graph
            .add_edge(&start, &update, Edge::new())
            .expect("edge");
        workflow
    }

    async fn seed(
        store: &MemoryStore,
        contacts: Option<&MemoryContacts>,
        workflow: &Workflow,
    ) -> WorkflowEnrollment {
        store.insert_workflow(workflow).await.expect("workflow");
        let contact = Contact::new();
        if let Some(contacts) = contacts {
            contacts.insert(contact.clone());
        }
        let enrollment = WorkflowEnrollment::new(workflow.id, contact.id);
        let execution = WorkflowExecution::new(enrollment.id, NodeId::from("start"));
        store
            .insert_enrollment(&enrollment, &execution)
            .await
            .expect("enroll");
        enrollment
    }

    struct FailingContacts;

    #[async_trait]
    impl ContactStore for FailingContacts {
        async fn get(&self, _id: &ContactId) -> Result<Option<Contact>, ContactStoreError> {
            Err(ContactStoreError::new("contacts offline"))
        }

        async fn update_status(
            &self,
            _id: &ContactId,
            _status: &str,
        ) -> Result<(), ContactStoreError> {
            Err(ContactStoreError::new("contacts offline"))
        }
    }

    #[tokio::test]
    async fn tick_drives_cursors_through_the_workflow() {
        let store = Arc::new(MemoryStore::new());
        let contacts = Arc::new(MemoryContacts::new());
        let workflow = two_step_workflow();
        let enrollment = seed(&store, Some(&contacts), &workflow).await;
        let poller = poller_for(store.clone(), contacts.clone());

        let first = poller.tick().await;
        assert_eq!(first.claimed, 1);
        assert_eq!(first.advanced, 1);

        let second = poller.tick().await;
        assert_eq!(second.claimed, 1);
        assert_eq!(second.completed, 1);

        let stored = store
            .get_enrollment(&enrollment.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, EnrollmentStatus::Completed);
        assert_eq!(
            contacts.status_of(&enrollment.contact_id).as_deref(),
            Some("done")
        );

        let third = poller.tick().await;
        assert_eq!(third.claimed, 0);
    }

    #[tokio::test]
    async fn idle_tick_claims_nothing() {
        let store = Arc::new(MemoryStore::new());
        let poller = poller_for(store, Arc::new(MemoryContacts::new()));
        let summary = poller.tick().await;
        assert_eq!(summary, TickSummary::default());
    }

    #[tokio::test]
    async fn step_errors_send_the_cursor_back_to_the_queue() {
        let store = Arc::new(MemoryStore::new());
        let workflow = two_step_workflow();
        let enrollment = seed(&store, None, &workflow).await;
        let poller = poller_for(store.clone(), Arc::new(FailingContacts));

        let summary = poller.tick().await;
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.errors, 1);

        let cursor = store
            .execution_for_enrollment(&enrollment.id)
            .await
            .expect("query")
            .expect("cursor");
        assert_eq!(cursor.status, ExecutionStatus::Waiting);
        // the release hands the claimed attempt back
        assert_eq!(cursor.attempts, 0);
        assert!(cursor.next_run_at.is_some());
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let store = Arc::new(MemoryStore::new());
        let poller = poller_for(store, Arc::new(MemoryContacts::new()));
        let shutdown = poller.shutdown_handle();
        let task = tokio::spawn(poller.run());
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("poller stopped")
            .expect("poller task");
    }
}
