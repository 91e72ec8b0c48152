//! Postgres-backed engine store.
//!
//! Implements the engine's storage seam over four tables: workflows,
//! workflow_enrollments, workflow_executions, and
//! workflow_execution_logs. The claim query uses `FOR UPDATE SKIP
//! LOCKED` so concurrent schedulers never share a cursor.

use async_trait::async_trait;
use cadence_core::{ContactId, EnrollmentId, ExecutionId, ExecutionLogId, WorkflowId};
use cadence_workflow::definition::Workflow;
use cadence_workflow::enrollment::{EnrollmentStatus, WorkflowEnrollment};
use cadence_workflow::execution::{
    ExecutionData, ExecutionLogStatus, ExecutionStatus, ReplyFlag, WorkflowExecution,
    WorkflowExecutionLog,
};
use cadence_workflow::graph::WorkflowGraph;
use cadence_workflow::node::NodeId;
use cadence_workflow::store::{EngineStore, StatusCounts, StepRecord, StoreError};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

fn db_error(error: sqlx::Error) -> StoreError {
    StoreError::new(error.to_string())
}

fn json_error(error: serde_json::Error) -> StoreError {
    StoreError::new(error.to_string())
}

/// Row type for workflow queries.
#[derive(FromRow)]
struct WorkflowRow {
    id: String,
    name: String,
    description: Option<String>,
    enabled: bool,
    graph_data: JsonValue,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    fn try_into_record(self) -> Result<Workflow, StoreError> {
        let id = WorkflowId::from_str(&self.id)
            .map_err(|e| StoreError::new(format!("invalid workflow id '{}': {}", self.id, e)))?;
        let graph: WorkflowGraph = serde_json::from_value(self.graph_data)
            .map_err(|e| StoreError::new(format!("invalid graph on workflow '{}': {}", id, e)))?;

        Ok(Workflow {
            id,
            name: self.name,
            description: self.description,
            enabled: self.enabled,
            graph,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row type for enrollment queries.
#[derive(FromRow)]
struct EnrollmentRow {
    id: String,
    workflow_id: String,
    contact_id: String,
    status: String,
    enrolled_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    stop_reason: Option<String>,
    parent_enrollment_id: Option<String>,
    parent_node_id: Option<String>,
}

impl EnrollmentRow {
    fn try_into_record(self) -> Result<WorkflowEnrollment, StoreError> {
        let id = EnrollmentId::from_str(&self.id)
            .map_err(|e| StoreError::new(format!("invalid enrollment id '{}': {}", self.id, e)))?;
        let workflow_id = WorkflowId::from_str(&self.workflow_id).map_err(|e| {
            StoreError::new(format!("invalid workflow id '{}': {}", self.workflow_id, e))
        })?;
        let contact_id = ContactId::from_str(&self.contact_id).map_err(|e| {
            StoreError::new(format!("invalid contact id '{}': {}", self.contact_id, e))
        })?;
        let parent_enrollment_id = self
            .parent_enrollment_id
            .map(|pid| {
                EnrollmentId::from_str(&pid).map_err(|e| {
                    StoreError::new(format!("invalid parent enrollment id '{pid}': {e}"))
                })
            })
            .transpose()?;

        Ok(WorkflowEnrollment {
            id,
            workflow_id,
            contact_id,
            status: EnrollmentStatus::from_str_value(&self.status),
            enrolled_at: self.enrolled_at,
            completed_at: self.completed_at,
            stopped_at: self.stopped_at,
            stop_reason: self.stop_reason,
            parent_enrollment_id,
            parent_node_id: self.parent_node_id.map(NodeId::from),
        })
    }
}

/// Row type for execution cursor queries.
#[derive(FromRow)]
struct ExecutionRow {
    id: String,
    enrollment_id: String,
    current_node_id: String,
    status: String,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    attempts: i32,
    max_attempts: i32,
    error_message: Option<String>,
    execution_data: JsonValue,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ExecutionRow {
    fn try_into_record(self) -> Result<WorkflowExecution, StoreError> {
        let id = ExecutionId::from_str(&self.id)
            .map_err(|e| StoreError::new(format!("invalid execution id '{}': {}", self.id, e)))?;
        let enrollment_id = EnrollmentId::from_str(&self.enrollment_id).map_err(|e| {
            StoreError::new(format!(
                "invalid enrollment id '{}': {}",
                self.enrollment_id, e
            ))
        })?;
        let data: ExecutionData = serde_json::from_value(self.execution_data)
            .map_err(|e| StoreError::new(format!("invalid execution data on '{}': {}", id, e)))?;

        Ok(WorkflowExecution {
            id,
            enrollment_id,
            current_node_id: NodeId::from(self.current_node_id),
            status: ExecutionStatus::from_str_value(&self.status),
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            max_attempts: u32::try_from(self.max_attempts).unwrap_or(0),
            error_message: self.error_message,
            data,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row type for execution log queries.
#[derive(FromRow)]
struct ExecutionLogRow {
    id: String,
    execution_id: String,
    enrollment_id: String,
    node_id: String,
    node_type: String,
    status: String,
    input_data: Option<JsonValue>,
    output_data: Option<JsonValue>,
    error_message: Option<String>,
    duration_ms: Option<i64>,
    created_at: DateTime<Utc>,
}

impl ExecutionLogRow {
    fn try_into_record(self) -> Result<WorkflowExecutionLog, StoreError> {
        let id = ExecutionLogId::from_str(&self.id)
            .map_err(|e| StoreError::new(format!("invalid log id '{}': {}", self.id, e)))?;
        let execution_id = ExecutionId::from_str(&self.execution_id).map_err(|e| {
            StoreError::new(format!(
                "invalid execution id '{}': {}",
                self.execution_id, e
            ))
        })?;
        let enrollment_id = EnrollmentId::from_str(&self.enrollment_id).map_err(|e| {
            StoreError::new(format!(
                "invalid enrollment id '{}': {}",
                self.enrollment_id, e
            ))
        })?;

        Ok(WorkflowExecutionLog {
            id,
            execution_id,
            enrollment_id,
            node_id: NodeId::from(self.node_id),
            node_type: self.node_type,
            status: ExecutionLogStatus::from_str_value(&self.status),
            input_data: self.input_data,
            output_data: self.output_data,
            error_message: self.error_message,
            duration_ms: self.duration_ms,
            created_at: self.created_at,
        })
    }
}

/// Repository implementing the engine's storage seam.
pub struct PgEngineStore {
    pool: PgPool,
}

impl PgEngineStore {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EngineStore for PgEngineStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let graph_data = serde_json::to_value(&workflow.graph).map_err(json_error)?;
        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, description, enabled, graph_data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, description = EXCLUDED.description,
                enabled = EXCLUDED.enabled, graph_data = EXCLUDED.graph_data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.enabled)
        .bind(&graph_data)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn get_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, enabled, graph_data, created_at, updated_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(r) => Ok(Some(r.try_into_record()?)),
            None => Ok(None),
        }
    }

    async fn insert_enrollment(
        &self,
        enrollment: &WorkflowEnrollment,
        execution: &WorkflowExecution,
    ) -> Result<(), StoreError> {
        let execution_data = serde_json::to_value(&execution.data).map_err(json_error)?;
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_enrollments
                (id, workflow_id, contact_id, status, enrolled_at, completed_at,
                 stopped_at, stop_reason, parent_enrollment_id, parent_node_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(enrollment.id.to_string())
        .bind(enrollment.workflow_id.to_string())
        .bind(enrollment.contact_id.to_string())
        .bind(enrollment.status.as_str())
        .bind(enrollment.enrolled_at)
        .bind(enrollment.completed_at)
        .bind(enrollment.stopped_at)
        .bind(&enrollment.stop_reason)
        .bind(enrollment.parent_enrollment_id.map(|p| p.to_string()))
        .bind(enrollment.parent_node_id.as_ref().map(NodeId::to_string))
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, enrollment_id, current_node_id, status, next_run_at, last_run_at,
                 attempts, max_attempts, error_message, execution_data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.enrollment_id.to_string())
        .bind(execution.current_node_id.to_string())
        .bind(execution.status.as_str())
        .bind(execution.next_run_at)
        .bind(execution.last_run_at)
        .bind(execution.attempts as i32)
        .bind(execution.max_attempts as i32)
        .bind(&execution.error_message)
        .bind(&execution_data)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn get_enrollment(
        &self,
        id: &EnrollmentId,
    ) -> Result<Option<WorkflowEnrollment>, StoreError> {
        let row: Option<EnrollmentRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, contact_id, status, enrolled_at, completed_at,
                   stopped_at, stop_reason, parent_enrollment_id, parent_node_id
            FROM workflow_enrollments
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(r) => Ok(Some(r.try_into_record()?)),
            None => Ok(None),
        }
    }

    async fn update_enrollment(
        &self,
        enrollment: &WorkflowEnrollment,
    ) -> Result<bool, StoreError> {
        // terminal rows never change; the status guard enforces it
        let result = sqlx::query(
            r#"
            UPDATE workflow_enrollments
            SET status = $2, completed_at = $3, stopped_at = $4, stop_reason = $5
            WHERE id = $1 AND status IN ('active', 'paused')
            "#,
        )
        .bind(enrollment.id.to_string())
        .bind(enrollment.status.as_str())
        .bind(enrollment.completed_at)
        .bind(enrollment.stopped_at)
        .bind(&enrollment.stop_reason)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_active_enrollment(
        &self,
        workflow_id: &WorkflowId,
        contact_id: &ContactId,
    ) -> Result<Option<WorkflowEnrollment>, StoreError> {
        let row: Option<EnrollmentRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, contact_id, status, enrolled_at, completed_at,
                   stopped_at, stop_reason, parent_enrollment_id, parent_node_id
            FROM workflow_enrollments
            WHERE workflow_id = $1 AND contact_id = $2 AND status IN ('active', 'paused')
            LIMIT 1
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(contact_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(r) => Ok(Some(r.try_into_record()?)),
            None => Ok(None),
        }
    }

    async fn active_enrollments_for_contact(
        &self,
        contact_id: &ContactId,
    ) -> Result<Vec<WorkflowEnrollment>, StoreError> {
        let rows: Vec<EnrollmentRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, contact_id, status, enrolled_at, completed_at,
                   stopped_at, stop_reason, parent_enrollment_id, parent_node_id
            FROM workflow_enrollments
            WHERE contact_id = $1 AND status = 'active'
            ORDER BY enrolled_at ASC
            "#,
        )
        .bind(contact_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(|r| r.try_into_record()).collect()
    }

    async fn latest_child_enrollment(
        &self,
        parent_enrollment_id: &EnrollmentId,
        parent_node_id: &NodeId,
    ) -> Result<Option<WorkflowEnrollment>, StoreError> {
        let row: Option<EnrollmentRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, contact_id, status, enrolled_at, completed_at,
                   stopped_at, stop_reason, parent_enrollment_id, parent_node_id
            FROM workflow_enrollments
            WHERE parent_enrollment_id = $1 AND parent_node_id = $2
            ORDER BY enrolled_at DESC
            LIMIT 1
            "#,
        )
        .bind(parent_enrollment_id.to_string())
        .bind(parent_node_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(r) => Ok(Some(r.try_into_record()?)),
            None => Ok(None),
        }
    }

    async fn status_counts(&self, workflow_id: &WorkflowId) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM workflow_enrollments
            WHERE workflow_id = $1
            GROUP BY status
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(
                EnrollmentStatus::from_str_value(&status),
                u64::try_from(count).unwrap_or(0),
            );
        }
        Ok(counts)
    }

    async fn get_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, enrollment_id, current_node_id, status, next_run_at, last_run_at,
                   attempts, max_attempts, error_message, execution_data, created_at, updated_at
            FROM workflow_executions
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(r) => Ok(Some(r.try_into_record()?)),
            None => Ok(None),
        }
    }

    async fn execution_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, enrollment_id, current_node_id, status, next_run_at, last_run_at,
                   attempts, max_attempts, error_message, execution_data, created_at, updated_at
            FROM workflow_executions
            WHERE enrollment_id = $1
            "#,
        )
        .bind(enrollment_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(r) => Ok(Some(r.try_into_record()?)),
            None => Ok(None),
        }
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            r#"
            UPDATE workflow_executions we
            SET status = 'processing', attempts = we.attempts + 1,
                last_run_at = $1, updated_at = $1
            FROM (
                SELECT we2.id
                FROM workflow_executions we2
                JOIN workflow_enrollments e ON e.id = we2.enrollment_id
                WHERE we2.status = 'waiting'
                  AND (we2.next_run_at IS NULL OR we2.next_run_at <= $1)
                  AND e.status = 'active'
                ORDER BY we2.next_run_at ASC NULLS FIRST
                LIMIT $2
                FOR UPDATE OF we2 SKIP LOCKED
            ) due
            WHERE we.id = due.id
            RETURNING we.id, we.enrollment_id, we.current_node_id, we.status,
                      we.next_run_at, we.last_run_at, we.attempts, we.max_attempts,
                      we.error_message, we.execution_data, we.created_at, we.updated_at
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(|r| r.try_into_record()).collect()
    }

    async fn release_execution(
        &self,
        id: &ExecutionId,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'waiting', next_run_at = $2,
                attempts = GREATEST(attempts - 1, 0), updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.to_string())
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn skip_idle_execution(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'skipped', next_run_at = NULL, updated_at = NOW()
            WHERE enrollment_id = $1 AND status = 'waiting'
            "#,
        )
        .bind(enrollment_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn persist_step(&self, record: &StepRecord) -> Result<(), StoreError> {
        let execution = &record.execution;
        let execution_data = serde_json::to_value(&execution.data).map_err(json_error)?;
        let log = &record.log;
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        if let Some(enrollment) = &record.enrollment {
            sqlx::query(
                r#"
                UPDATE workflow_enrollments
                SET status = $2, completed_at = $3, stopped_at = $4, stop_reason = $5
                WHERE id = $1 AND status IN ('active', 'paused')
                "#,
            )
            .bind(enrollment.id.to_string())
            .bind(enrollment.status.as_str())
            .bind(enrollment.completed_at)
            .bind(enrollment.stopped_at)
            .bind(&enrollment.stop_reason)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        // a reply flagged while the step was in flight survives the write
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET current_node_id = $2, status = $3, next_run_at = $4, last_run_at = $5,
                attempts = $6, max_attempts = $7, error_message = $8,
                execution_data = CASE
                    WHEN COALESCE(execution_data->'stopped_by_reply', 'null'::jsonb) <> 'null'::jsonb
                         AND COALESCE($9::jsonb->'stopped_by_reply', 'null'::jsonb) = 'null'::jsonb
                    THEN jsonb_set($9::jsonb, '{stopped_by_reply}',
                                   execution_data->'stopped_by_reply')
                    ELSE $9::jsonb
                END,
                updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.current_node_id.to_string())
        .bind(execution.status.as_str())
        .bind(execution.next_run_at)
        .bind(execution.last_run_at)
        .bind(execution.attempts as i32)
        .bind(execution.max_attempts as i32)
        .bind(&execution.error_message)
        .bind(&execution_data)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_execution_logs
                (id, execution_id, enrollment_id, node_id, node_type, status,
                 input_data, output_data, error_message, duration_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.execution_id.to_string())
        .bind(log.enrollment_id.to_string())
        .bind(log.node_id.to_string())
        .bind(&log.node_type)
        .bind(log.status.as_str())
        .bind(&log.input_data)
        .bind(&log.output_data)
        .bind(&log.error_message)
        .bind(log.duration_ms)
        .bind(log.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn flag_reply(
        &self,
        execution_id: &ExecutionId,
        flag: &ReplyFlag,
    ) -> Result<bool, StoreError> {
        let flag_json = serde_json::to_value(flag).map_err(json_error)?;
        // the first reply wins; later ones leave the flag untouched
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET execution_data = jsonb_set(execution_data, '{stopped_by_reply}', $2::jsonb),
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('waiting', 'processing')
              AND COALESCE(execution_data->'stopped_by_reply', 'null'::jsonb) = 'null'::jsonb
            "#,
        )
        .bind(execution_id.to_string())
        .bind(&flag_json)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn logs_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Vec<WorkflowExecutionLog>, StoreError> {
        let rows: Vec<ExecutionLogRow> = sqlx::query_as(
            r#"
            SELECT id, execution_id, enrollment_id, node_id, node_type, status,
                   input_data, output_data, error_message, duration_ms, created_at
            FROM workflow_execution_logs
            WHERE enrollment_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(enrollment_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(|r| r.try_into_record()).collect()
    }
}
