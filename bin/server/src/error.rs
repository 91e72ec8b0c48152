//! Domain error types for API handlers and their HTTP mappings.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cadence_workflow::enroll::EnrollError;
use cadence_workflow::store::StoreError;
use serde_json::json;
use std::fmt;

/// Errors returned by API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The requested resource does not exist.
    NotFound { message: String },
    /// The request was malformed.
    Invalid { message: String },
    /// The request was well-formed but cannot be applied.
    Unprocessable { message: String },
    /// Something failed on our side.
    Internal { message: String },
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Invalid { .. } => StatusCode::BAD_REQUEST,
            Self::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message exposed to clients. Internal details stay in the logs.
    fn public_message(&self) -> &str {
        match self {
            Self::NotFound { message }
            | Self::Invalid { message }
            | Self::Unprocessable { message } => message,
            Self::Internal { .. } => "internal error",
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { message }
            | Self::Invalid { message }
            | Self::Unprocessable { message }
            | Self::Internal { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<EnrollError> for ApiError {
    fn from(error: EnrollError) -> Self {
        let message = error.to_string();
        match error {
            EnrollError::WorkflowNotFound { .. } | EnrollError::EnrollmentNotFound { .. } => {
                Self::NotFound { message }
            }
            EnrollError::WorkflowDisabled { .. } | EnrollError::InvalidWorkflow { .. } => {
                Self::Unprocessable { message }
            }
            EnrollError::Store { .. } | EnrollError::Contacts { .. } => Self::Internal { message },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self::Internal {
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{EnrollmentId, WorkflowId};

    #[test]
    fn enroll_errors_map_to_expected_statuses() {
        let cases = [
            (
                ApiError::from(EnrollError::WorkflowNotFound {
                    workflow_id: WorkflowId::new(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(EnrollError::EnrollmentNotFound {
                    enrollment_id: EnrollmentId::new(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(EnrollError::WorkflowDisabled {
                    workflow_id: WorkflowId::new(),
                }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::from(EnrollError::InvalidWorkflow {
                    message: "no trigger".to_string(),
                }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::from(EnrollError::Store {
                    message: "down".to_string(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.status(), expected);
        }
    }

    #[test]
    fn internal_errors_hide_their_details() {
        let error = ApiError::Internal {
            message: "connection pool exhausted at 10.0.0.5".to_string(),
        };
        assert_eq!(error.public_message(), "internal error");

        let error = ApiError::NotFound {
            message: "workflow 'wf_x' not found".to_string(),
        };
        assert_eq!(error.public_message(), "workflow 'wf_x' not found");
    }
}
