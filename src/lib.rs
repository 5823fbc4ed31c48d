//! Ticketing API Gateway
//!
//! Admission control and metering for a multi-tenant ticketing platform's
//! public API. Every call is authenticated by API key, checked against the
//! key's access policy, held to layered rate limits and a monthly quota, and
//! recorded in an append-only usage ledger.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum, with the pipeline as a middleware layer
//! - **Storage**: `CredentialStore` / `UsageLedger` traits, PostgreSQL (sqlx) or in-memory
//! - **Authentication**: `tk_` API keys, bcrypt-hashed, looked up by 8-character prefix
//! - **Metering**: fire-and-forget usage appends on spawned tasks

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use crate::middleware::gateway::{Gateway, gateway_middleware};
use crate::services::api_key_service::ApiKeyPolicy;
use crate::store::CredentialStore;

/// Shared state handed to the middleware and handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub credentials: Arc<dyn CredentialStore>,
    /// Hashing cost and default limits for keys issued over HTTP
    pub key_policy: ApiKeyPolicy,
}

/// Build the HTTP router.
///
/// The gateway layer wraps every route; public paths configured on the
/// gateway (such as `/health`) pass straight through it.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/v1/me", get(handlers::api_keys::get_me))
        .route("/api/v1/usage", get(handlers::api_keys::get_usage))
        // Key management (admin keys only)
        .route("/api/v1/keys", post(handlers::key_admin::create_key))
        .route("/api/v1/keys/{id}", delete(handlers::key_admin::delete_key))
        .route("/api/v1/keys/{id}/rotate", post(handlers::key_admin::rotate_key))
        .route("/api/v1/keys/{id}/revoke", post(handlers::key_admin::revoke_key))
        .route("/api/v1/keys/{id}/activate", post(handlers::key_admin::activate_key))
        .route(
            "/api/v1/keys/{id}/deactivate",
            post(handlers::key_admin::deactivate_key),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            gateway_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
