//! HTTP routes for the enrollment API.

use crate::error::ApiError;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use cadence_core::{ContactId, EnrollmentId, WorkflowId};
use cadence_workflow::enroll::{EnrollOutcome, EnrollmentManager};
use cadence_workflow::execution::{ReplyChannel, WorkflowExecutionLog};
use cadence_workflow::store::{EngineStore, StatusCounts};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<EnrollmentManager>,
    pub store: Arc<dyn EngineStore>,
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/workflows/{id}/enroll",
            post(enroll_contacts).get(enrollment_counts),
        )
        .route("/enrollments/{id}/stop", post(stop_enrollment))
        .route("/enrollments/{id}/pause", post(pause_enrollment))
        .route("/enrollments/{id}/resume", post(resume_enrollment))
        .route("/enrollments/{id}/logs", get(enrollment_logs))
        .route("/webhooks/replies", post(reply_received))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Request body for bulk enrollment.
#[derive(Debug, Deserialize)]
struct EnrollRequest {
    contact_ids: Vec<String>,
    /// When true, contacts already active in the workflow count as
    /// skipped instead of errors.
    #[serde(default = "default_skip_duplicates", alias = "skipDuplicates")]
    skip_duplicates: bool,
}

fn default_skip_duplicates() -> bool {
    true
}

async fn enroll_contacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EnrollRequest>,
) -> Result<Json<EnrollOutcome>, ApiError> {
    let workflow_id = parse_workflow_id(&id)?;
    let outcome = state
        .manager
        .enroll_contacts(&workflow_id, &request.contact_ids, request.skip_duplicates)
        .await?;
    Ok(Json(outcome))
}

async fn enrollment_counts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusCounts>, ApiError> {
    let workflow_id = parse_workflow_id(&id)?;
    let counts = state.manager.status_counts(&workflow_id).await?;
    Ok(Json(counts))
}

#[derive(Debug, Default, Deserialize)]
struct StopRequest {
    reason: Option<String>,
}

async fn stop_enrollment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StopRequest>>,
) -> Result<Json<JsonValue>, ApiError> {
    let enrollment_id = parse_enrollment_id(&id)?;
    let reason = body.and_then(|Json(request)| request.reason);
    let updated = state
        .manager
        .stop_enrollment(&enrollment_id, reason)
        .await?;
    Ok(Json(json!({ "updated": updated })))
}

async fn pause_enrollment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let enrollment_id = parse_enrollment_id(&id)?;
    let updated = state.manager.pause_enrollment(&enrollment_id).await?;
    Ok(Json(json!({ "updated": updated })))
}

async fn resume_enrollment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let enrollment_id = parse_enrollment_id(&id)?;
    let updated = state.manager.resume_enrollment(&enrollment_id).await?;
    Ok(Json(json!({ "updated": updated })))
}

async fn enrollment_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<WorkflowExecutionLog>>, ApiError> {
    let enrollment_id = parse_enrollment_id(&id)?;
    if state
        .manager
        .get_enrollment(&enrollment_id)
        .await?
        .is_none()
    {
        return Err(ApiError::NotFound {
            message: format!("enrollment '{enrollment_id}' not found"),
        });
    }
    let logs = state.store.logs_for_enrollment(&enrollment_id).await?;
    Ok(Json(logs))
}

/// Inbound reply notification from a messaging provider.
#[derive(Debug, Deserialize)]
struct ReplyNotice {
    contact_id: String,
    channel: ReplyChannel,
}

async fn reply_received(
    State(state): State<AppState>,
    Json(notice): Json<ReplyNotice>,
) -> Result<Json<JsonValue>, ApiError> {
    let contact_id =
        notice
            .contact_id
            .parse::<ContactId>()
            .map_err(|e| ApiError::Invalid {
                message: e.to_string(),
            })?;
    let flagged = state
        .manager
        .on_reply_received(&contact_id, notice.channel)
        .await?;
    Ok(Json(json!({ "flagged": flagged })))
}

fn parse_workflow_id(raw: &str) -> Result<WorkflowId, ApiError> {
    raw.parse::<WorkflowId>().map_err(|e| ApiError::Invalid {
        message: e.to_string(),
    })
}

fn parse_enrollment_id(raw: &str) -> Result<EnrollmentId, ApiError> {
    raw.parse::<EnrollmentId>().map_err(|e| ApiError::Invalid {
        message: e.to_string(),
    })
}
