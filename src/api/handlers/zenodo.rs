//! Zenodo deposit handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::api::{ApiError, ApiState};
use crate::deposit::{
    CreateOutcome, CreateRequest, FlushReport, FlushRequest, PublishOutcome, PublishRequest,
    SubmissionState, UploadRequest,
};
use crate::resource::SubmissionId;
use crate::store::{DepositRecord, UploadReceipt};

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub issue_id: SubmissionId,
    /// False when an existing record was returned.
    pub created: bool,
    pub deposits: DepositRecord,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse<T> {
    pub issue_id: SubmissionId,
    pub outcomes: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub issue_id: SubmissionId,
    #[serde(flatten)]
    pub report: FlushReport,
}

/// Create deposits for a submission.
pub async fn create(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<CreateResponse>), ApiError> {
    let outcome = state.orchestrator.create(&request).await?;

    let (status, created) = match &outcome {
        CreateOutcome::Created(_) => (StatusCode::CREATED, true),
        CreateOutcome::Existing(_) => (StatusCode::OK, false),
    };

    Ok((
        status,
        Json(CreateResponse {
            issue_id: request.issue_id,
            created,
            deposits: outcome.into_record(),
        }),
    ))
}

/// Archive and upload one resource.
pub async fn upload(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadReceipt>, ApiError> {
    let receipt = state.orchestrator.upload(&request).await?;
    Ok(Json(receipt))
}

/// Delete deposits; one outcome per requested type. A record that could
/// not be rewritten afterwards is a 500 that still carries the outcomes.
pub async fn flush(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<FlushRequest>,
) -> Result<(StatusCode, Json<FlushResponse>), ApiError> {
    let report = state.orchestrator.flush(&request).await?;
    let status = if report.is_complete() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((
        status,
        Json(FlushResponse {
            issue_id: request.issue_id,
            report,
        }),
    ))
}

/// Publish every uploaded deposit.
pub async fn publish(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<BatchResponse<PublishOutcome>>, ApiError> {
    let outcomes = state.orchestrator.publish(&request).await?;
    Ok(Json(BatchResponse {
        issue_id: request.issue_id,
        outcomes,
    }))
}

/// Current deposit state of a submission.
pub async fn get_record(
    State(state): State<Arc<ApiState>>,
    Path(issue_id): Path<u32>,
) -> Result<Json<SubmissionState>, ApiError> {
    state
        .orchestrator
        .read_record(SubmissionId(issue_id))
        .map(Json)
        .map_err(ApiError::for_read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::tests::FakeTools;
    use crate::archiver::ResourceArchiver;
    use crate::build::{BinderHubTrigger, BuildDispatcher};
    use crate::deposit::tests::{metadata, FakeDepositApi};
    use crate::deposit::DepositOrchestrator;
    use crate::lock::{LockStore, DEFAULT_STALE_AFTER};
    use crate::resource::ResourceType;
    use crate::store::DepositStore;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    fn state(temp: &TempDir, api: FakeDepositApi) -> Arc<ApiState> {
        let tools = Arc::new(FakeTools::default());
        let orchestrator = DepositOrchestrator::new(
            DepositStore::new(temp.path().join("zenodo"), "NeuroLibre"),
            ResourceArchiver::new(temp.path().join("archives"), "10.55458", "NeuroLibre", tools.clone()),
            Arc::new(api),
            "10.55458",
            "NeuroLibre",
        )
        .with_request_delay(Duration::ZERO);
        let dispatcher = BuildDispatcher::new(
            LockStore::new(temp.path().join("locks"), DEFAULT_STALE_AFTER),
            Arc::new(BinderHubTrigger::new(reqwest::Client::new())),
            tools,
            "https://binder.conp.cloud",
        );
        Arc::new(ApiState::new(orchestrator, dispatcher))
    }

    fn create_request() -> CreateRequest {
        CreateRequest {
            issue_id: SubmissionId(42),
            resources: vec![ResourceType::Book, ResourceType::Repository],
            metadata: metadata(),
        }
    }

    #[tokio::test]
    async fn test_create_then_existing() {
        let temp = TempDir::new().unwrap();
        let state = state(&temp, FakeDepositApi::default());

        let (status, Json(body)) = create(State(state.clone()), Json(create_request()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert!(body.created);
        assert_eq!(body.deposits.len(), 2);

        let (status, Json(body)) = create(State(state), Json(create_request())).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(!body.created);
    }

    #[tokio::test]
    async fn test_failed_create_is_bad_gateway() {
        let temp = TempDir::new().unwrap();
        let api = FakeDepositApi {
            fail_create: HashSet::from([ResourceType::Book]),
            ..Default::default()
        };
        let err = create(State(state(&temp, api)), Json(create_request()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.body().error, "partial_batch_failure");
    }

    #[tokio::test]
    async fn test_publish_before_upload_is_conflict() {
        let temp = TempDir::new().unwrap();
        let state = state(&temp, FakeDepositApi::default());
        create(State(state.clone()), Json(create_request())).await.unwrap();

        let err = publish(
            State(state),
            Json(PublishRequest {
                issue_id: SubmissionId(42),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_zero_issue_id_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let state = state(&temp, FakeDepositApi::default());
        let mut request = create_request();
        request.issue_id = SubmissionId(0);

        let err = create(State(state.clone()), Json(request)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = get_record(State(state), Path(0)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_record() {
        let temp = TempDir::new().unwrap();
        let state = state(&temp, FakeDepositApi::default());

        let err = get_record(State(state.clone()), Path(42)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        create(State(state.clone()), Json(create_request())).await.unwrap();
        let Json(record) = get_record(State(state), Path(42)).await.unwrap();
        assert_eq!(record.deposits.len(), 2);
        assert!(record.uploaded.is_empty());
    }

    #[tokio::test]
    async fn test_flush_reports_in_order() {
        let temp = TempDir::new().unwrap();
        let state = state(&temp, FakeDepositApi::default());
        create(State(state.clone()), Json(create_request())).await.unwrap();

        let (status, Json(body)) = flush(
            State(state),
            Json(FlushRequest {
                issue_id: SubmissionId(42),
                resources: vec![ResourceType::Repository, ResourceType::Dataset],
            }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::OK);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["issue_id"], 42);
        assert!(json.get("record_error").is_none());
        assert_eq!(json["outcomes"][0]["resource"], "repository");
        assert_eq!(json["outcomes"][0]["status"], "deleted");
        assert_eq!(json["outcomes"][1]["status"], "not_in_record");
    }
}
