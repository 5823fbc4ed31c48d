//! API key authentication.
//!
//! # Flow
//!
//! 1. Pull the raw key from `Authorization: Bearer`, `X-API-Key`, or (relaxed
//!    mode only) the `api_key` query parameter
//! 2. Reject anything without the `tk_` tag
//! 3. Load every active key sharing the first 8 characters
//! 4. For each candidate, oldest first: expire it if past `expires_at`,
//!    otherwise verify the full key against its bcrypt hash
//! 5. First match wins and has `last_used_at` bumped
//!
//! Every failure is reported as the same `Unauthenticated` error.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::api_key::{ApiKey, ApiKeyStatus};
use crate::store::CredentialStore;

/// Tag every issued key starts with.
pub const API_KEY_TAG: &str = "tk_";

/// Number of leading characters stored as the lookup prefix.
pub const KEY_PREFIX_LEN: usize = 8;

/// Extract the raw API key from a request, first non-empty source wins.
pub fn extract_api_key(headers: &HeaderMap, query: Option<&str>, relaxed: bool) -> Option<String> {
    let bearer = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim);

    let header_key = headers
        .get("x-api-key")
        .and_then(|h| h.to_str().ok())
        .map(str::trim);

    let query_key = relaxed
        .then(|| {
            query.and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(name, _)| name == "api_key")
                    .map(|(_, value)| value.trim().to_string())
            })
        })
        .flatten();

    bearer
        .into_iter()
        .chain(header_key)
        .map(str::to_string)
        .chain(query_key)
        .find(|key| !key.is_empty())
}

/// Lookup prefix for a raw key, or `None` if it cannot be one of ours.
pub fn key_prefix(raw_key: &str) -> Option<&str> {
    if !raw_key.starts_with(API_KEY_TAG) {
        return None;
    }
    raw_key.get(..KEY_PREFIX_LEN)
}

#[derive(Clone)]
pub struct ApiKeyAuthenticator {
    store: Arc<dyn CredentialStore>,
}

impl ApiKeyAuthenticator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Resolve `raw_key` to an active, unexpired API key.
    ///
    /// # Errors
    ///
    /// - `Unauthenticated` for any key that does not verify
    /// - `Database`/`Internal` if the candidate lookup itself fails
    pub async fn authenticate(&self, raw_key: &str, now: DateTime<Utc>) -> Result<ApiKey, AppError> {
        let prefix = key_prefix(raw_key).ok_or(AppError::Unauthenticated)?;

        let candidates = self
            .store
            .find_by_prefix(prefix, ApiKeyStatus::Active)
            .await?;

        for candidate in candidates {
            if candidate.is_expired_at(now) {
                self.expire(&candidate).await;
                continue;
            }

            if verify_secret(raw_key, &candidate.key_hash).await? {
                if let Err(e) = self.store.touch_last_used(candidate.id, now).await {
                    tracing::warn!(api_key_id = %candidate.id, "failed to update last_used_at: {}", e);
                }
                return Ok(ApiKey {
                    last_used_at: Some(now),
                    ..candidate
                });
            }
        }

        Err(AppError::Unauthenticated)
    }

    /// Lazy expiry. The request is rejected whether or not the write lands.
    async fn expire(&self, api_key: &ApiKey) {
        match self
            .store
            .update_status(api_key.id, ApiKeyStatus::Expired)
            .await
        {
            Ok(_) => tracing::info!(api_key_id = %api_key.id, "API key expired"),
            Err(e) => {
                tracing::warn!(api_key_id = %api_key.id, "failed to mark API key expired: {}", e)
            }
        }
    }
}

/// bcrypt verification on the blocking pool. Malformed hashes never match.
async fn verify_secret(raw_key: &str, key_hash: &str) -> Result<bool, AppError> {
    let raw_key = raw_key.to_string();
    let key_hash = key_hash.to_string();

    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(&raw_key, &key_hash))
        .await
        .map_err(|e| anyhow::anyhow!("bcrypt verification task failed: {e}"))?;

    Ok(verified.unwrap_or_else(|e| {
        tracing::warn!("unverifiable API key hash: {}", e);
        false
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_header_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tk_fromBearer"));
        headers.insert("x-api-key", HeaderValue::from_static("tk_fromHeader"));

        assert_eq!(
            extract_api_key(&headers, Some("api_key=tk_fromQuery"), true).as_deref(),
            Some("tk_fromBearer")
        );
    }

    #[test]
    fn test_empty_bearer_falls_through_to_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        headers.insert("x-api-key", HeaderValue::from_static("tk_fromHeader"));

        assert_eq!(
            extract_api_key(&headers, None, false).as_deref(),
            Some("tk_fromHeader")
        );
    }

    #[test]
    fn test_query_parameter_only_in_relaxed_mode() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_api_key(&headers, Some("page=1&api_key=tk_fromQuery"), true).as_deref(),
            Some("tk_fromQuery")
        );
        assert_eq!(extract_api_key(&headers, Some("api_key=tk_fromQuery"), false), None);
    }

    #[test]
    fn test_key_prefix_requires_tag_and_length() {
        assert_eq!(key_prefix("tk_AbCdEfGhIj"), Some("tk_AbCdE"));
        assert_eq!(key_prefix("sk_AbCdEfGhIj"), None);
        assert_eq!(key_prefix("tk_abc"), None);
    }
}
