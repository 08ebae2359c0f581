//! Mapping of pipeline errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{json, Value};

use crate::build::BuildError;
use crate::error::{PublisherError, StateProblem};
use crate::resource::SubmissionId;

/// JSON error payload.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<SubmissionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &ErrorBody {
        &self.body
    }

    /// Like `From<PublisherError>`, but a missing record is a 404.
    pub fn for_read(err: PublisherError) -> Self {
        let missing = matches!(
            err,
            PublisherError::InconsistentState {
                problem: StateProblem::NoRecord,
                ..
            }
        );
        let mut api = Self::from(err);
        if missing {
            api.status = StatusCode::NOT_FOUND;
            api.body.error = "not_found";
        }
        api
    }
}

impl From<PublisherError> for ApiError {
    fn from(err: PublisherError) -> Self {
        let status = match &err {
            PublisherError::Validation(_) => StatusCode::BAD_REQUEST,
            PublisherError::InconsistentState { .. } => StatusCode::CONFLICT,
            PublisherError::RemoteUnavailable { .. } | PublisherError::PartialBatchFailure { .. } => {
                StatusCode::BAD_GATEWAY
            }
            PublisherError::Artifact { .. } | PublisherError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let detail = match &err {
            PublisherError::RemoteUnavailable { resource, step, .. } => {
                Some(json!({ "resource": resource, "step": step }))
            }
            PublisherError::Artifact { resource, step, .. } => {
                Some(json!({ "resource": resource, "step": step }))
            }
            PublisherError::InconsistentState { problem, .. } => serde_json::to_value(problem).ok(),
            PublisherError::PartialBatchFailure {
                failures,
                compensated,
                ..
            } => Some(json!({ "failures": failures, "compensated": compensated })),
            PublisherError::Validation(_) | PublisherError::Store(_) => None,
        };

        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }

        Self {
            status,
            body: ErrorBody {
                error: err.kind(),
                message: err.to_string(),
                issue_id: err.submission(),
                detail,
            },
        }
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        let status = match &err {
            BuildError::Validation(_) => StatusCode::BAD_REQUEST,
            BuildError::ResolveHead { .. } | BuildError::Http(_) | BuildError::Status { .. } => {
                StatusCode::BAD_GATEWAY
            }
            BuildError::Lock(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                error: err.kind(),
                message: err.to_string(),
                issue_id: None,
                detail: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self.body)).into_response()
    }
}
