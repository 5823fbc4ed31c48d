//! API key lifecycle: issue, rotate, revoke, activate, deactivate, delete.
//!
//! The plaintext key exists only in the return value of `create_api_key` and
//! `rotate_api_key`; only its bcrypt hash and 8-character prefix are stored.

use chrono::Utc;
use rand::{Rng, distr::Alphanumeric};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::api_key::{
    ApiKey, ApiKeyResponse, ApiKeyStatus, CreateApiKeyRequest, PermissionSet,
};
use crate::services::authenticator::{API_KEY_TAG, KEY_PREFIX_LEN};
use crate::store::CredentialStore;

/// Random characters after the tag.
const KEY_RANDOM_LEN: usize = 40;

/// Hashing and default limits applied to newly issued keys.
#[derive(Debug, Clone, Copy)]
pub struct ApiKeyPolicy {
    pub bcrypt_cost: u32,
    pub default_rate_limit_per_hour: i32,
    pub default_monthly_quota: i64,
}

/// A freshly issued or rotated key. `key` is shown once and never again.
#[derive(Debug, Serialize)]
pub struct IssuedApiKey {
    pub key: String,
    pub api_key: ApiKeyResponse,
}

/// Generate a new plaintext key: `tk_` followed by 40 alphanumeric characters.
pub fn generate_api_key() -> String {
    let random: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{API_KEY_TAG}{random}")
}

/// Hash a plaintext key on the blocking pool.
pub async fn hash_api_key(key: &str, cost: u32) -> Result<String, AppError> {
    let key = key.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(&key, cost))
        .await
        .map_err(|e| anyhow::anyhow!("bcrypt hashing task failed: {e}"))?
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to hash API key: {e}")))
}

fn prefix_of(key: &str) -> String {
    key[..KEY_PREFIX_LEN].to_string()
}

/// Issue a new API key.
///
/// # Errors
///
/// - `InvalidRequest`: empty name or negative limits
/// - `Database`: insert failed
pub async fn create_api_key(
    store: &dyn CredentialStore,
    policy: &ApiKeyPolicy,
    request: CreateApiKeyRequest,
) -> Result<IssuedApiKey, AppError> {
    if request.name.trim().is_empty() {
        return Err(AppError::InvalidRequest("Name must not be empty".to_string()));
    }

    let rate_limit_per_hour = request
        .rate_limit_per_hour
        .unwrap_or(policy.default_rate_limit_per_hour);
    let monthly_quota = request.monthly_quota.unwrap_or(policy.default_monthly_quota);
    if rate_limit_per_hour < 0 || monthly_quota < 0 {
        return Err(AppError::InvalidRequest(
            "Limits must not be negative".to_string(),
        ));
    }

    let key = generate_api_key();
    let key_hash = hash_api_key(&key, policy.bcrypt_cost).await?;
    let now = Utc::now();

    let api_key = ApiKey {
        id: Uuid::new_v4(),
        name: request.name,
        key_hash,
        key_prefix: prefix_of(&key),
        status: ApiKeyStatus::Active,
        permissions: PermissionSet(request.permissions),
        scopes: request.scopes,
        allowed_ips: request.allowed_ips,
        allowed_domains: request
            .allowed_domains
            .into_iter()
            .map(|d| d.to_ascii_lowercase())
            .collect(),
        rate_limit_per_hour,
        monthly_quota,
        expires_at: request.expires_at,
        last_used_at: None,
        tenant_id: request.tenant_id,
        user_id: request.user_id,
        metadata: request
            .metadata
            .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
        created_at: now,
        updated_at: now,
    };

    store.insert(&api_key).await?;
    tracing::info!(api_key_id = %api_key.id, prefix = %api_key.key_prefix, "API key created");

    Ok(IssuedApiKey {
        key,
        api_key: api_key.into(),
    })
}

/// Replace a key's secret and reactivate it. The old secret stops working.
pub async fn rotate_api_key(
    store: &dyn CredentialStore,
    policy: &ApiKeyPolicy,
    id: Uuid,
) -> Result<IssuedApiKey, AppError> {
    let key = generate_api_key();
    let key_hash = hash_api_key(&key, policy.bcrypt_cost).await?;

    let api_key = store
        .replace_secret(id, &key_hash, &prefix_of(&key))
        .await?
        .ok_or(AppError::ApiKeyNotFound)?;
    tracing::info!(api_key_id = %id, prefix = %api_key.key_prefix, "API key rotated");

    Ok(IssuedApiKey {
        key,
        api_key: api_key.into(),
    })
}

pub async fn revoke_api_key(store: &dyn CredentialStore, id: Uuid) -> Result<(), AppError> {
    set_status(store, id, ApiKeyStatus::Revoked).await
}

pub async fn activate_api_key(store: &dyn CredentialStore, id: Uuid) -> Result<(), AppError> {
    set_status(store, id, ApiKeyStatus::Active).await
}

pub async fn deactivate_api_key(store: &dyn CredentialStore, id: Uuid) -> Result<(), AppError> {
    set_status(store, id, ApiKeyStatus::Inactive).await
}

pub async fn delete_api_key(store: &dyn CredentialStore, id: Uuid) -> Result<(), AppError> {
    if !store.delete(id).await? {
        return Err(AppError::ApiKeyNotFound);
    }
    tracing::info!(api_key_id = %id, "API key deleted");
    Ok(())
}

async fn set_status(
    store: &dyn CredentialStore,
    id: Uuid,
    status: ApiKeyStatus,
) -> Result<(), AppError> {
    if !store.update_status(id, status).await? {
        return Err(AppError::ApiKeyNotFound);
    }
    tracing::info!(api_key_id = %id, status = %status, "API key status changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::api_key::Permission;
    use crate::services::authenticator::ApiKeyAuthenticator;
    use crate::store::memory::InMemoryCredentialStore;
    use std::sync::Arc;

    const POLICY: ApiKeyPolicy = ApiKeyPolicy {
        bcrypt_cost: 4,
        default_rate_limit_per_hour: 1000,
        default_monthly_quota: 100_000,
    };

    fn request(name: &str) -> CreateApiKeyRequest {
        CreateApiKeyRequest {
            name: name.to_string(),
            permissions: vec![Permission::Read],
            ..Default::default()
        }
    }

    #[test]
    fn test_generated_keys_are_tagged_and_unique() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert!(a.starts_with("tk_"));
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_create_stores_hash_and_prefix_only() {
        let store = InMemoryCredentialStore::new();
        let issued = create_api_key(&store, &POLICY, request("box office")).await.unwrap();

        let stored = store.find_by_id(issued.api_key.id).await.unwrap().unwrap();
        assert_ne!(stored.key_hash, issued.key);
        assert_eq!(stored.key_prefix, &issued.key[..8]);
        assert!(bcrypt::verify(&issued.key, &stored.key_hash).unwrap());
        assert_eq!(stored.rate_limit_per_hour, 1000);
        assert_eq!(stored.status, ApiKeyStatus::Active);
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name() {
        let store = InMemoryCredentialStore::new();
        let err = create_api_key(&store, &POLICY, request("  ")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_rotate_invalidates_old_key_and_reactivates() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let authenticator = ApiKeyAuthenticator::new(store.clone());
        let issued = create_api_key(store.as_ref(), &POLICY, request("scanner")).await.unwrap();
        let id = issued.api_key.id;

        revoke_api_key(store.as_ref(), id).await.unwrap();
        let rotated = rotate_api_key(store.as_ref(), &POLICY, id).await.unwrap();

        assert_eq!(rotated.api_key.status, ApiKeyStatus::Active);
        assert_ne!(rotated.key, issued.key);
        assert!(matches!(
            authenticator.authenticate(&issued.key, Utc::now()).await,
            Err(AppError::Unauthenticated)
        ));
        let resolved = authenticator.authenticate(&rotated.key, Utc::now()).await.unwrap();
        assert_eq!(resolved.id, id);
    }

    #[tokio::test]
    async fn test_status_changes_on_unknown_key() {
        let store = InMemoryCredentialStore::new();
        let missing = Uuid::new_v4();
        assert!(matches!(
            deactivate_api_key(&store, missing).await,
            Err(AppError::ApiKeyNotFound)
        ));
        assert!(matches!(
            delete_api_key(&store, missing).await,
            Err(AppError::ApiKeyNotFound)
        ));
    }

    #[tokio::test]
    async fn test_deactivate_then_activate() {
        let store = InMemoryCredentialStore::new();
        let issued = create_api_key(&store, &POLICY, request("kiosk")).await.unwrap();
        let id = issued.api_key.id;

        deactivate_api_key(&store, id).await.unwrap();
        assert_eq!(
            store.find_by_id(id).await.unwrap().unwrap().status,
            ApiKeyStatus::Inactive
        );
        activate_api_key(&store, id).await.unwrap();
        assert_eq!(
            store.find_by_id(id).await.unwrap().unwrap().status,
            ApiKeyStatus::Active
        );
        delete_api_key(&store, id).await.unwrap();
        assert!(store.find_by_id(id).await.unwrap().is_none());
    }
}
