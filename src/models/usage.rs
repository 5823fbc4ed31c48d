//! Usage ledger records.
//!
//! Every request attempt that resolves an API key produces one root record.
//! Records are never updated; a corrected outcome for an admitted request is
//! written as a new record whose `supersedes_id` points at the root record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::api_key::ParseEnumError;

/// Classified result of a request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    Error,
    RateLimited,
    Unauthorized,
    Forbidden,
}

impl UsageOutcome {
    /// Classify a final response.
    ///
    /// 429, 401 and 403 map to their dedicated outcomes; any other status of
    /// 400 or above, or an attached error message, counts as an error.
    pub fn classify(status_code: u16, error_message: Option<&str>) -> Self {
        match status_code {
            429 => UsageOutcome::RateLimited,
            401 => UsageOutcome::Unauthorized,
            403 => UsageOutcome::Forbidden,
            code if code >= 400 => UsageOutcome::Error,
            _ if error_message.is_some() => UsageOutcome::Error,
            _ => UsageOutcome::Success,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageOutcome::Success => "success",
            UsageOutcome::Error => "error",
            UsageOutcome::RateLimited => "rate_limited",
            UsageOutcome::Unauthorized => "unauthorized",
            UsageOutcome::Forbidden => "forbidden",
        }
    }
}

impl fmt::Display for UsageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageOutcome {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(UsageOutcome::Success),
            "error" => Ok(UsageOutcome::Error),
            "rate_limited" => Ok(UsageOutcome::RateLimited),
            "unauthorized" => Ok(UsageOutcome::Unauthorized),
            "forbidden" => Ok(UsageOutcome::Forbidden),
            other => Err(ParseEnumError::new("outcome", other)),
        }
    }
}

impl TryFrom<String> for UsageOutcome {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, ParseEnumError> {
        value.parse()
    }
}

/// A stored usage record from the `api_usage` table.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub api_key_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub endpoint: String,
    pub method: String,
    pub status_code: i32,
    #[sqlx(try_from = "String")]
    pub outcome: UsageOutcome,
    pub response_time_ms: i64,
    pub request_size: Option<i64>,
    pub response_size: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    /// Request headers with credentials removed
    pub headers: serde_json::Value,
    /// Query parameters with credentials removed
    pub query_params: serde_json::Value,
    pub error_message: Option<String>,
    /// Root record this one corrects, if any
    pub supersedes_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A usage record waiting to be appended. The ledger assigns `created_at`.
#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub id: Uuid,
    pub api_key_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub outcome: UsageOutcome,
    pub response_time_ms: i64,
    pub request_size: Option<i64>,
    pub response_size: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub headers: serde_json::Value,
    pub query_params: serde_json::Value,
    pub error_message: Option<String>,
    pub supersedes_id: Option<Uuid>,
}

impl NewUsageRecord {
    /// Build the superseding record for this root record once the final
    /// response is known.
    pub fn superseded_by(
        &self,
        status_code: u16,
        response_time_ms: i64,
        response_size: Option<i64>,
        error_message: Option<String>,
    ) -> NewUsageRecord {
        NewUsageRecord {
            id: Uuid::new_v4(),
            supersedes_id: Some(self.id),
            status_code,
            outcome: UsageOutcome::classify(status_code, error_message.as_deref()),
            response_time_ms,
            response_size,
            error_message,
            ..self.clone()
        }
    }

    /// Materialise the record as stored, stamped with `created_at`.
    pub fn into_record(self, created_at: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            id: self.id,
            api_key_id: self.api_key_id,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            endpoint: self.endpoint,
            method: self.method,
            status_code: i32::from(self.status_code),
            outcome: self.outcome,
            response_time_ms: self.response_time_ms,
            request_size: self.request_size,
            response_size: self.response_size,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            referrer: self.referrer,
            headers: self.headers,
            query_params: self.query_params,
            error_message: self.error_message,
            supersedes_id: self.supersedes_id,
            created_at,
        }
    }
}

/// Filter for counting root usage records over an inclusive time range.
///
/// `None` fields are unconstrained. `endpoint` matches as a path prefix.
#[derive(Debug, Clone)]
pub struct UsageQuery {
    pub api_key_id: Option<Uuid>,
    pub endpoint: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl UsageQuery {
    pub fn for_key(api_key_id: Uuid, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            api_key_id: Some(api_key_id),
            endpoint: None,
            tenant_id: None,
            from,
            to,
        }
    }

    /// Whether a stored record falls under this query.
    pub fn matches(&self, record: &UsageRecord) -> bool {
        record.supersedes_id.is_none()
            && record.created_at >= self.from
            && record.created_at <= self.to
            && self.api_key_id.is_none_or(|id| record.api_key_id == id)
            && self.tenant_id.is_none_or(|id| record.tenant_id == Some(id))
            && self
                .endpoint
                .as_deref()
                .is_none_or(|prefix| record.endpoint.starts_with(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_dedicated_statuses() {
        assert_eq!(UsageOutcome::classify(429, None), UsageOutcome::RateLimited);
        assert_eq!(UsageOutcome::classify(401, None), UsageOutcome::Unauthorized);
        assert_eq!(UsageOutcome::classify(403, Some("scope")), UsageOutcome::Forbidden);
    }

    #[test]
    fn test_classify_errors() {
        assert_eq!(UsageOutcome::classify(404, None), UsageOutcome::Error);
        assert_eq!(UsageOutcome::classify(500, None), UsageOutcome::Error);
        // A 2xx carrying an error message is still an error
        assert_eq!(UsageOutcome::classify(200, Some("partial failure")), UsageOutcome::Error);
        assert_eq!(UsageOutcome::classify(201, None), UsageOutcome::Success);
    }

    #[test]
    fn test_outcome_decodes_from_column_text() {
        assert_eq!(
            UsageOutcome::try_from("rate_limited".to_string()).unwrap(),
            UsageOutcome::RateLimited
        );
        assert_eq!(
            UsageOutcome::try_from("error".to_string()).unwrap(),
            UsageOutcome::Error
        );
        assert!(UsageOutcome::try_from("throttled".to_string()).is_err());
    }

    fn root_record() -> NewUsageRecord {
        NewUsageRecord {
            id: Uuid::new_v4(),
            api_key_id: Uuid::new_v4(),
            tenant_id: None,
            user_id: None,
            endpoint: "/api/v1/events".to_string(),
            method: "GET".to_string(),
            status_code: 200,
            outcome: UsageOutcome::Success,
            response_time_ms: 3,
            request_size: None,
            response_size: None,
            ip_address: Some("10.0.0.1".to_string()),
            user_agent: None,
            referrer: None,
            headers: serde_json::json!({}),
            query_params: serde_json::json!({}),
            error_message: None,
            supersedes_id: None,
        }
    }

    #[test]
    fn test_superseding_record_links_root_and_reclassifies() {
        let root = root_record();
        let last = root.superseded_by(500, 42, Some(128), None);

        assert_ne!(last.id, root.id);
        assert_eq!(last.supersedes_id, Some(root.id));
        assert_eq!(last.outcome, UsageOutcome::Error);
        assert_eq!(last.api_key_id, root.api_key_id);
        assert_eq!(last.endpoint, root.endpoint);
        assert_eq!(last.response_size, Some(128));
    }

    #[test]
    fn test_query_ignores_superseding_records() {
        let root = root_record();
        let now = Utc::now();
        let query = UsageQuery::for_key(root.api_key_id, now - chrono::Duration::hours(1), now);

        let superseding = root.superseded_by(200, 5, None, None).into_record(now);
        let stored_root = root.into_record(now);

        assert!(query.matches(&stored_root));
        assert!(!query.matches(&superseding));
    }

    #[test]
    fn test_query_endpoint_matches_as_prefix() {
        let now = Utc::now();
        let record = root_record().into_record(now);
        let mut query = UsageQuery::for_key(record.api_key_id, now, now);

        query.endpoint = Some("/api/v1/events".to_string());
        assert!(query.matches(&record));
        query.endpoint = Some("/api/v1/orders".to_string());
        assert!(!query.matches(&record));
    }
}
