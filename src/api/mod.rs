//! REST API for the publisher daemon.
//!
//! Provides HTTP endpoints for:
//! - Build dispatch (streamed BinderHub output)
//! - Zenodo deposit create / upload / flush / publish
//! - Reading a submission's deposit state

pub mod error;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::build::BuildDispatcher;
use crate::deposit::DepositOrchestrator;

pub use error::ApiError;

/// Shared state for API handlers.
pub struct ApiState {
    pub orchestrator: DepositOrchestrator,
    pub dispatcher: BuildDispatcher,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(orchestrator: DepositOrchestrator, dispatcher: BuildDispatcher) -> Self {
        Self {
            orchestrator,
            dispatcher,
            started_at: Instant::now(),
        }
    }
}

/// Build the API router with all routes.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/status", get(handlers::status::health))
        // Builds
        .route("/api/v1/resources/books", post(handlers::build::dispatch_build))
        // Zenodo
        .route("/api/v1/zenodo/create", post(handlers::zenodo::create))
        .route("/api/v1/zenodo/upload", post(handlers::zenodo::upload))
        .route("/api/v1/zenodo/flush", post(handlers::zenodo::flush))
        .route("/api/v1/zenodo/publish", post(handlers::zenodo::publish))
        .route("/api/v1/zenodo/:issue_id", get(handlers::zenodo::get_record))
        // Middleware
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                // Only log responses that are not 2xx
                .on_request(())
                .on_response(|response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                    let status = response.status();
                    if !status.is_success() {
                        tracing::warn!(
                            status = %status,
                            latency_ms = latency.as_millis(),
                            "request failed"
                        );
                    }
                })
        )
        .with_state(state)
}

/// Start the API server.
pub async fn serve(state: Arc<ApiState>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    tracing::info!("Publisher API listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
