//! Status and health check handlers.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::ApiState;

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,

    pub version: &'static str,

    /// BinderHub builds are dispatched to.
    pub binder_url: String,

    /// Seconds since the daemon started.
    pub uptime_secs: u64,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION"),
        binder_url: state.dispatcher.binder_url().to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
