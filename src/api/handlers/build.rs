//! Build dispatch handler.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;

use crate::api::{ApiError, ApiState};
use crate::build::{BuildConflict, BuildEvent, BuildRequest, Dispatch};

/// 409 payload when the repository is already building.
#[derive(Serialize)]
pub struct ConflictResponse {
    pub error: &'static str,
    #[serde(flatten)]
    pub conflict: BuildConflict,
}

/// Trigger a book build and stream BinderHub's output as plain text.
pub async fn dispatch_build(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<BuildRequest>,
) -> Result<Response, ApiError> {
    match state.dispatcher.dispatch(&request).await? {
        Dispatch::Started(stream) => {
            let body = stream.map(|event| {
                Ok::<_, Infallible>(match event {
                    BuildEvent::Line(line) => Bytes::from(format!("{}\n", line)),
                    BuildEvent::Finished => Bytes::new(),
                })
            });
            Ok((
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                Body::from_stream(body),
            )
                .into_response())
        }
        Dispatch::AlreadyBuilding(conflict) => Ok((
            StatusCode::CONFLICT,
            Json(ConflictResponse {
                error: "already_building",
                conflict,
            }),
        )
            .into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::tests::FakeTools;
    use crate::archiver::ResourceArchiver;
    use crate::build::{BuildDispatcher, BuildError, BuildTrigger, ChunkStream};
    use crate::deposit::tests::FakeDepositApi;
    use crate::deposit::DepositOrchestrator;
    use crate::lock::{LockKey, LockStore, DEFAULT_STALE_AFTER};
    use crate::store::DepositStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct EchoTrigger;

    #[async_trait]
    impl BuildTrigger for EchoTrigger {
        async fn trigger(&self, build_url: &str) -> Result<ChunkStream, BuildError> {
            let line = Bytes::from(format!("data: {{\"phase\": \"built\", \"message\": \"{}\"}}\n", build_url));
            Ok(futures_util::stream::iter(vec![Ok(line)]).boxed())
        }
    }

    fn state(temp: &TempDir) -> Arc<ApiState> {
        let tools = Arc::new(FakeTools::default());
        let orchestrator = DepositOrchestrator::new(
            DepositStore::new(temp.path().join("zenodo"), "NeuroLibre"),
            ResourceArchiver::new(temp.path().join("archives"), "10.55458", "NeuroLibre", tools.clone()),
            Arc::new(FakeDepositApi::default()),
            "10.55458",
            "NeuroLibre",
        );
        let dispatcher = BuildDispatcher::new(
            LockStore::new(temp.path().join("locks"), DEFAULT_STALE_AFTER),
            Arc::new(EchoTrigger),
            tools,
            "https://binder.conp.cloud",
        );
        Arc::new(ApiState::new(orchestrator, dispatcher))
    }

    fn request() -> BuildRequest {
        BuildRequest {
            repo_url: "https://github.com/neurolibre/book".to_string(),
            commit: Some("abc123".to_string()),
        }
    }

    #[tokio::test]
    async fn test_streams_lines() {
        let temp = TempDir::new().unwrap();
        let response = match dispatch_build(State(state(&temp)), Json(request())).await {
            Ok(response) => response,
            Err(err) => panic!("dispatch failed: {:?}", err),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("/build/gh/neurolibre/book.git/abc123"));
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_busy_is_conflict() {
        let temp = TempDir::new().unwrap();
        let state = state(&temp);
        let locks = LockStore::new(temp.path().join("locks"), DEFAULT_STALE_AFTER);
        let _held = locks.try_acquire(&LockKey::new("gh", "neurolibre", "book")).unwrap();

        let response = match dispatch_build(State(state), Json(request())).await {
            Ok(response) => response,
            Err(err) => panic!("dispatch failed: {:?}", err),
        };
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "already_building");
        assert_eq!(json["status_url"], "https://binder.conp.cloud/v2/gh/neurolibre/book/abc123");
    }

    #[tokio::test]
    async fn test_invalid_repo_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let bad = BuildRequest {
            repo_url: "https://github.com/only-org".to_string(),
            commit: None,
        };
        match dispatch_build(State(state(&temp)), Json(bad)).await {
            Err(err) => assert_eq!(err.status(), StatusCode::BAD_REQUEST),
            Ok(response) => panic!("unexpected status {}", response.status()),
        }
    }
}
