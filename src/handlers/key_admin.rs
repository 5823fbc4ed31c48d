//! API key management endpoints.
//!
//! - POST /api/v1/keys - Issue a new key
//! - POST /api/v1/keys/{id}/rotate - Replace a key's secret
//! - POST /api/v1/keys/{id}/revoke - Revoke a key
//! - POST /api/v1/keys/{id}/activate - Reactivate an inactive key
//! - POST /api/v1/keys/{id}/deactivate - Suspend a key
//! - DELETE /api/v1/keys/{id} - Delete a key
//!
//! Every route runs behind the gateway like any other call, and additionally
//! requires the calling key to hold `admin`. A tenant-bound admin key only
//! sees keys of its own tenant; keys of other tenants answer 404.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use crate::{
    AppState,
    error::AppError,
    middleware::gateway::AuthContext,
    models::api_key::{CreateApiKeyRequest, Permission},
    services::{
        access_policy::PolicyViolation,
        api_key_service::{self, IssuedApiKey},
    },
};

fn require_admin(auth: &AuthContext) -> Result<(), AppError> {
    if auth.permissions.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden(PolicyViolation::MissingPermission(
            Permission::Admin,
        )))
    }
}

/// Fails with `ApiKeyNotFound` unless `id` exists and is visible to `auth`.
async fn ensure_manageable(state: &AppState, auth: &AuthContext, id: Uuid) -> Result<(), AppError> {
    let target = state
        .credentials
        .find_by_id(id)
        .await?
        .ok_or(AppError::ApiKeyNotFound)?;

    match auth.tenant_id {
        Some(tenant_id) if target.tenant_id != Some(tenant_id) => Err(AppError::ApiKeyNotFound),
        _ => Ok(()),
    }
}

/// Issue a new API key.
///
/// # Endpoint
///
/// `POST /api/v1/keys`
///
/// # Request Body
///
/// ```json
/// {
///   "name": "Box office POS",
///   "permissions": ["read", "write"],
///   "scopes": ["/api/v1/tickets*"],
///   "rate_limit_per_hour": 600
/// }
/// ```
///
/// # Response
///
/// - **Success (201 Created)**: the plaintext `key` (shown only here) and
///   the stored key's public view
/// - **Error (400)**: blank name or negative limits
/// - **Error (403)**: calling key is not an admin
///
/// A tenant-bound caller always issues into its own tenant, whatever the
/// body says.
pub async fn create_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(mut request): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<IssuedApiKey>), AppError> {
    require_admin(&auth)?;
    if auth.tenant_id.is_some() {
        request.tenant_id = auth.tenant_id;
    }

    let issued =
        api_key_service::create_api_key(state.credentials.as_ref(), &state.key_policy, request)
            .await?;
    tracing::info!(
        admin_key_id = %auth.api_key_id,
        api_key_id = %issued.api_key.id,
        "API key issued over HTTP"
    );

    Ok((StatusCode::CREATED, Json(issued)))
}

/// `POST /api/v1/keys/{id}/rotate`. Returns the new plaintext key once; the
/// old secret stops working immediately.
pub async fn rotate_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<IssuedApiKey>, AppError> {
    require_admin(&auth)?;
    ensure_manageable(&state, &auth, id).await?;

    let issued =
        api_key_service::rotate_api_key(state.credentials.as_ref(), &state.key_policy, id).await?;
    Ok(Json(issued))
}

pub async fn revoke_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_admin(&auth)?;
    ensure_manageable(&state, &auth, id).await?;
    api_key_service::revoke_api_key(state.credentials.as_ref(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn activate_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_admin(&auth)?;
    ensure_manageable(&state, &auth, id).await?;
    api_key_service::activate_api_key(state.credentials.as_ref(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deactivate_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_admin(&auth)?;
    ensure_manageable(&state, &auth, id).await?;
    api_key_service::deactivate_api_key(state.credentials.as_ref(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_admin(&auth)?;
    ensure_manageable(&state, &auth, id).await?;
    api_key_service::delete_api_key(state.credentials.as_ref(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}
