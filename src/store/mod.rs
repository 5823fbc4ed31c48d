//! Persistence contracts used by the gateway.
//!
//! The gateway only ever talks to these traits. `postgres` backs them with
//! sqlx; `memory` keeps everything in process for tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::api_key::{ApiKey, ApiKeyStatus};
use crate::models::usage::{NewUsageRecord, UsageQuery};

pub mod memory;
pub mod postgres;

/// Keyed storage of API keys.
///
/// Implementations never see plaintext keys, only bcrypt hashes and the
/// 8-character lookup prefix.
///
/// # Errors
///
/// Every method fails with `AppError::Database` (or `AppError::Internal` for
/// non-SQL backends) when the backing store cannot be reached. Missing rows
/// are reported through the return value, never as an error.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// All keys with the given prefix and status, oldest first (ties broken by id).
    ///
    /// Prefixes are not unique, so callers must verify the secret against
    /// each candidate.
    async fn find_by_prefix(
        &self,
        key_prefix: &str,
        status: ApiKeyStatus,
    ) -> Result<Vec<ApiKey>, AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ApiKey>, AppError>;

    /// Returns `false` when no key has this id.
    async fn update_status(&self, id: Uuid, status: ApiKeyStatus) -> Result<bool, AppError>;

    /// Set `last_used_at`. Unknown ids are ignored.
    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError>;

    /// Store a new key. The id must not already exist.
    async fn insert(&self, api_key: &ApiKey) -> Result<(), AppError>;

    /// Swap in a new secret and reactivate the key. Returns the updated key.
    async fn replace_secret(
        &self,
        id: Uuid,
        key_hash: &str,
        key_prefix: &str,
    ) -> Result<Option<ApiKey>, AppError>;

    /// Returns `false` when no key has this id.
    async fn delete(&self, id: Uuid) -> Result<bool, AppError>;

    /// Cheap connectivity check for health probes.
    async fn ping(&self) -> Result<(), AppError>;
}

/// Append-only log of request attempts.
///
/// Each admitted request produces a root record and later a superseding
/// record pointing at it; only root records are counted.
///
/// # Errors
///
/// Both methods fail with `AppError::Database` / `AppError::Internal` when
/// the ledger is unavailable. Append failures are logged and dropped by the
/// usage recorder; count failures deny the request with a 500.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Persist `record`, stamping its `created_at` at write time.
    async fn append(&self, record: NewUsageRecord) -> Result<(), AppError>;

    /// Number of root records (superseding writes excluded) matching `query`.
    async fn count(&self, query: &UsageQuery) -> Result<i64, AppError>;
}
