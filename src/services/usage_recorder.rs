//! Fire-and-forget usage metering.
//!
//! Appends run on tasks spawned through a [`TaskTracker`] so the response path
//! never waits on the ledger. Failures are logged and dropped. Shutdown and
//! tests wait for outstanding appends with [`UsageRecorder::flush`].

use std::sync::Arc;

use axum::http::HeaderMap;
use serde_json::{Map, Value};
use tokio_util::task::TaskTracker;

use crate::models::usage::NewUsageRecord;
use crate::store::UsageLedger;

/// Headers never copied into usage records.
const REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
    "proxy-authorization",
];

/// Query parameters never copied into usage records.
const REDACTED_QUERY_PARAMS: &[&str] = &["api_key", "apikey", "token", "secret", "password"];

#[derive(Clone)]
pub struct UsageRecorder {
    ledger: Arc<dyn UsageLedger>,
    tasks: TaskTracker,
}

impl UsageRecorder {
    pub fn new(ledger: Arc<dyn UsageLedger>) -> Self {
        Self {
            ledger,
            tasks: TaskTracker::new(),
        }
    }

    /// Queue `record` for appending and return immediately.
    pub fn record(&self, record: NewUsageRecord) {
        let ledger = self.ledger.clone();

        self.tasks.spawn(async move {
            let record_id = record.id;
            let outcome = record.outcome;
            if let Err(e) = ledger.append(record).await {
                tracing::error!(usage_id = %record_id, "failed to record API usage: {}", e);
            } else {
                tracing::debug!(usage_id = %record_id, outcome = %outcome, "API usage recorded");
            }
        });
    }

    /// Number of appends that have not finished yet.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every queued append has finished (successfully or not).
    ///
    /// The recorder keeps accepting records afterwards.
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

/// Copy request headers into JSON, dropping credentials.
pub fn sanitize_headers(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        let name = name.as_str();
        if REDACTED_HEADERS.contains(&name) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            map.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(map)
}

/// Parse a raw query string into JSON, dropping credential parameters.
pub fn sanitize_query(query: Option<&str>) -> Value {
    let mut map = Map::new();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if REDACTED_QUERY_PARAMS.contains(&key.to_ascii_lowercase().as_str()) {
                continue;
            }
            map.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::usage::UsageOutcome;
    use crate::store::memory::InMemoryUsageLedger;
    use axum::http::HeaderValue;
    use uuid::Uuid;

    fn new_record() -> NewUsageRecord {
        NewUsageRecord {
            id: Uuid::new_v4(),
            api_key_id: Uuid::new_v4(),
            tenant_id: None,
            user_id: None,
            endpoint: "/api/v1/events".to_string(),
            method: "GET".to_string(),
            status_code: 200,
            outcome: UsageOutcome::Success,
            response_time_ms: 2,
            request_size: None,
            response_size: None,
            ip_address: None,
            user_agent: None,
            referrer: None,
            headers: Value::Object(Map::new()),
            query_params: Value::Object(Map::new()),
            error_message: None,
            supersedes_id: None,
        }
    }

    #[tokio::test]
    async fn test_flush_waits_for_appends() {
        let ledger = Arc::new(InMemoryUsageLedger::new());
        let recorder = UsageRecorder::new(ledger.clone());

        for _ in 0..5 {
            recorder.record(new_record());
        }
        recorder.flush().await;

        assert_eq!(recorder.pending(), 0);
        assert_eq!(ledger.records().await.len(), 5);
    }

    #[tokio::test]
    async fn test_append_failure_is_swallowed() {
        let ledger = Arc::new(InMemoryUsageLedger::new());
        ledger.set_fail_appends(true);
        let recorder = UsageRecorder::new(ledger.clone());

        recorder.record(new_record());
        recorder.flush().await;

        assert_eq!(recorder.pending(), 0);
        assert!(ledger.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending_returns() {
        let recorder = UsageRecorder::new(Arc::new(InMemoryUsageLedger::new()));
        recorder.flush().await;
    }

    #[tokio::test]
    async fn test_records_after_flush_are_still_tracked() {
        let ledger = Arc::new(InMemoryUsageLedger::new());
        let recorder = UsageRecorder::new(ledger.clone());

        recorder.record(new_record());
        recorder.flush().await;
        recorder.record(new_record());
        recorder.record(new_record());
        recorder.flush().await;

        assert_eq!(recorder.pending(), 0);
        assert_eq!(ledger.records().await.len(), 3);
    }

    #[test]
    fn test_sanitize_headers_drops_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tk_secret"));
        headers.insert("x-api-key", HeaderValue::from_static("tk_secret"));
        headers.insert("user-agent", HeaderValue::from_static("sdk/1.2"));

        let sanitized = sanitize_headers(&headers);
        assert_eq!(sanitized, serde_json::json!({"user-agent": "sdk/1.2"}));
    }

    #[test]
    fn test_sanitize_query_drops_credentials() {
        let sanitized = sanitize_query(Some("api_key=tk_secret&page=2&Token=abc"));
        assert_eq!(sanitized, serde_json::json!({"page": "2"}));
        assert_eq!(sanitize_query(None), serde_json::json!({}));
    }
}
