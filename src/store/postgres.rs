//! PostgreSQL implementations of the store traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::api_key::{ApiKey, ApiKeyStatus};
use crate::models::usage::{NewUsageRecord, UsageQuery};
use crate::store::{CredentialStore, UsageLedger};

const API_KEY_COLUMNS: &str = "id, name, key_hash, key_prefix, status, permissions, scopes, \
     allowed_ips, allowed_domains, rate_limit_per_hour, monthly_quota, expires_at, \
     last_used_at, tenant_id, user_id, metadata, created_at, updated_at";

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: DbPool,
}

impl PgCredentialStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_prefix(
        &self,
        key_prefix: &str,
        status: ApiKeyStatus,
    ) -> Result<Vec<ApiKey>, AppError> {
        let keys = sqlx::query_as::<_, ApiKey>(&format!(
            "SELECT {API_KEY_COLUMNS}
             FROM api_keys
             WHERE key_prefix = $1 AND status = $2
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(key_prefix)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ApiKey>, AppError> {
        let key = sqlx::query_as::<_, ApiKey>(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }

    async fn update_status(&self, id: Uuid, status: ApiKeyStatus) -> Result<bool, AppError> {
        let updated = sqlx::query(
            "UPDATE api_keys SET status = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE api_keys SET last_used_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert(&self, api_key: &ApiKey) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (
                id, name, key_hash, key_prefix, status, permissions, scopes,
                allowed_ips, allowed_domains, rate_limit_per_hour, monthly_quota,
                expires_at, last_used_at, tenant_id, user_id, metadata,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(api_key.id)
        .bind(&api_key.name)
        .bind(&api_key.key_hash)
        .bind(&api_key.key_prefix)
        .bind(api_key.status.as_str())
        .bind(api_key.permissions.to_strings())
        .bind(&api_key.scopes)
        .bind(&api_key.allowed_ips)
        .bind(&api_key.allowed_domains)
        .bind(api_key.rate_limit_per_hour)
        .bind(api_key.monthly_quota)
        .bind(api_key.expires_at)
        .bind(api_key.last_used_at)
        .bind(api_key.tenant_id)
        .bind(api_key.user_id)
        .bind(&api_key.metadata)
        .bind(api_key.created_at)
        .bind(api_key.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replace_secret(
        &self,
        id: Uuid,
        key_hash: &str,
        key_prefix: &str,
    ) -> Result<Option<ApiKey>, AppError> {
        let key = sqlx::query_as::<_, ApiKey>(&format!(
            "UPDATE api_keys
             SET key_hash = $1, key_prefix = $2, status = 'active', updated_at = NOW()
             WHERE id = $3
             RETURNING {API_KEY_COLUMNS}"
        ))
        .bind(key_hash)
        .bind(key_prefix)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let deleted = sqlx::query("DELETE FROM api_keys WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgUsageLedger {
    pool: DbPool,
}

impl PgUsageLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLedger for PgUsageLedger {
    async fn append(&self, record: NewUsageRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO api_usage (
                id, api_key_id, tenant_id, user_id, endpoint, method, status_code,
                outcome, response_time_ms, request_size, response_size, ip_address,
                user_agent, referrer, headers, query_params, error_message, supersedes_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(record.id)
        .bind(record.api_key_id)
        .bind(record.tenant_id)
        .bind(record.user_id)
        .bind(&record.endpoint)
        .bind(&record.method)
        .bind(i32::from(record.status_code))
        .bind(record.outcome.as_str())
        .bind(record.response_time_ms)
        .bind(record.request_size)
        .bind(record.response_size)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(&record.referrer)
        .bind(&record.headers)
        .bind(&record.query_params)
        .bind(&record.error_message)
        .bind(record.supersedes_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count(&self, query: &UsageQuery) -> Result<i64, AppError> {
        // NULL parameters leave the corresponding filter open
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM api_usage
            WHERE supersedes_id IS NULL
              AND created_at >= $1
              AND created_at <= $2
              AND ($3::UUID IS NULL OR api_key_id = $3)
              AND ($4::UUID IS NULL OR tenant_id = $4)
              AND ($5::TEXT IS NULL OR left(endpoint, length($5)) = $5)
            "#,
        )
        .bind(query.from)
        .bind(query.to)
        .bind(query.api_key_id)
        .bind(query.tenant_id)
        .bind(query.endpoint.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
