//! Introspection endpoints for the calling API key.
//!
//! - GET /api/v1/me - the key the request was authenticated with
//! - GET /api/v1/usage - the four rate limit tiers as evaluated for this request

use axum::{Extension, Json};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    middleware::gateway::AuthContext, models::api_key::PermissionSet,
    services::rate_limiter::RateLimitStatus,
};

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub api_key_id: Uuid,
    pub name: String,
    pub tenant_id: Option<Uuid>,
    pub permissions: PermissionSet,
    pub scopes: Vec<String>,
    pub rate_limit_per_hour: i32,
    pub monthly_quota: i64,
}

pub async fn get_me(Extension(auth): Extension<AuthContext>) -> Json<MeResponse> {
    Json(MeResponse {
        api_key_id: auth.api_key_id,
        name: auth.name,
        tenant_id: auth.tenant_id,
        permissions: auth.permissions,
        scopes: auth.scopes,
        rate_limit_per_hour: auth.rate_limit_per_hour,
        monthly_quota: auth.monthly_quota,
    })
}

/// Current tier usage.
///
/// Counts exclude this request, matching the `X-RateLimit-*` headers.
pub async fn get_usage(Extension(limits): Extension<RateLimitStatus>) -> Json<RateLimitStatus> {
    Json(limits)
}
