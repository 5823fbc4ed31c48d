//! In-process store implementations.
//!
//! Used by the test suites and for running the gateway without PostgreSQL.
//! `InMemoryUsageLedger` can be told to fail appends, which lets tests check
//! that ledger outages never reach the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::api_key::{ApiKey, ApiKeyStatus};
use crate::models::usage::{NewUsageRecord, UsageQuery, UsageRecord};
use crate::store::{CredentialStore, UsageLedger};

#[derive(Default)]
pub struct InMemoryCredentialStore {
    keys: RwLock<HashMap<Uuid, ApiKey>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_prefix(
        &self,
        key_prefix: &str,
        status: ApiKeyStatus,
    ) -> Result<Vec<ApiKey>, AppError> {
        let keys = self.keys.read().await;
        let mut matching: Vec<ApiKey> = keys
            .values()
            .filter(|k| k.key_prefix == key_prefix && k.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ApiKey>, AppError> {
        Ok(self.keys.read().await.get(&id).cloned())
    }

    async fn update_status(&self, id: Uuid, status: ApiKeyStatus) -> Result<bool, AppError> {
        let mut keys = self.keys.write().await;
        match keys.get_mut(&id) {
            Some(key) => {
                key.status = status;
                key.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        if let Some(key) = self.keys.write().await.get_mut(&id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn insert(&self, api_key: &ApiKey) -> Result<(), AppError> {
        self.keys.write().await.insert(api_key.id, api_key.clone());
        Ok(())
    }

    async fn replace_secret(
        &self,
        id: Uuid,
        key_hash: &str,
        key_prefix: &str,
    ) -> Result<Option<ApiKey>, AppError> {
        let mut keys = self.keys.write().await;
        Ok(keys.get_mut(&id).map(|key| {
            key.key_hash = key_hash.to_string();
            key.key_prefix = key_prefix.to_string();
            key.status = ApiKeyStatus::Active;
            key.updated_at = Utc::now();
            key.clone()
        }))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        Ok(self.keys.write().await.remove(&id).is_some())
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryUsageLedger {
    records: RwLock<Vec<UsageRecord>>,
    fail_appends: AtomicBool,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `append` fail (or succeed again).
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Insert an already-stamped record, bypassing `append`.
    pub async fn seed(&self, record: UsageRecord) {
        self.records.write().await.push(record);
    }

    /// Snapshot of every stored record in insertion order.
    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn append(&self, record: NewUsageRecord) -> Result<(), AppError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(AppError::Internal(anyhow::anyhow!(
                "usage ledger is unavailable"
            )));
        }

        let mut records = self.records.write().await;
        // Keep timestamps monotonic even if the wall clock steps back
        let now = Utc::now();
        let created_at = records
            .last()
            .map_or(now, |last| last.created_at.max(now));
        records.push(record.into_record(created_at));
        Ok(())
    }

    async fn count(&self, query: &UsageQuery) -> Result<i64, AppError> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| query.matches(r)).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::api_key::PermissionSet;
    use crate::models::usage::UsageOutcome;

    fn key_with_prefix(prefix: &str, created_at: DateTime<Utc>) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            key_hash: String::new(),
            key_prefix: prefix.to_string(),
            status: ApiKeyStatus::Active,
            permissions: PermissionSet::default(),
            scopes: vec![],
            allowed_ips: vec![],
            allowed_domains: vec![],
            rate_limit_per_hour: 1000,
            monthly_quota: 100_000,
            expires_at: None,
            last_used_at: None,
            tenant_id: None,
            user_id: None,
            metadata: serde_json::json!({}),
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn test_find_by_prefix_orders_by_creation() {
        let store = InMemoryCredentialStore::new();
        let now = Utc::now();
        let newer = key_with_prefix("tk_abcde", now);
        let older = key_with_prefix("tk_abcde", now - chrono::Duration::days(1));
        let other = key_with_prefix("tk_zzzzz", now);
        for key in [&newer, &older, &other] {
            store.insert(key).await.unwrap();
        }

        let found = store
            .find_by_prefix("tk_abcde", ApiKeyStatus::Active)
            .await
            .unwrap();
        let ids: Vec<Uuid> = found.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);

        store
            .update_status(older.id, ApiKeyStatus::Revoked)
            .await
            .unwrap();
        let found = store
            .find_by_prefix("tk_abcde", ApiKeyStatus::Active)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_ledger_rejects_append() {
        let ledger = InMemoryUsageLedger::new();
        ledger.set_fail_appends(true);

        let record = NewUsageRecord {
            id: Uuid::new_v4(),
            api_key_id: Uuid::new_v4(),
            tenant_id: None,
            user_id: None,
            endpoint: "/api/v1/events".to_string(),
            method: "GET".to_string(),
            status_code: 200,
            outcome: UsageOutcome::Success,
            response_time_ms: 1,
            request_size: None,
            response_size: None,
            ip_address: None,
            user_agent: None,
            referrer: None,
            headers: serde_json::json!({}),
            query_params: serde_json::json!({}),
            error_message: None,
            supersedes_id: None,
        };

        assert!(ledger.append(record).await.is_err());
        assert!(ledger.records().await.is_empty());
    }
}
