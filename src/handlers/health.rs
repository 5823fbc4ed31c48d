//! Liveness probe for load balancers.

use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`
    pub status: &'static str,
    pub credential_store: &'static str,
    /// Usage appends still in flight
    pub pending_usage_records: usize,
    pub checked_at: DateTime<Utc>,
}

/// `GET /health`. Public, so the gateway pipeline never runs for it.
///
/// Answers 503 when the credential store is unreachable, since no gated
/// request could be authenticated in that state.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status, credential_store) = match state.credentials.ping().await {
        Ok(()) => (StatusCode::OK, "ok", "reachable"),
        Err(e) => {
            tracing::warn!("health check: credential store unreachable: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", "unreachable")
        }
    };

    (
        code,
        Json(HealthResponse {
            status,
            credential_store,
            pending_usage_records: state.gateway.recorder().pending(),
            checked_at: Utc::now(),
        }),
    )
}
