//! Rate and quota evaluation against the usage ledger.
//!
//! Four tiers are computed for every gated request:
//!
//! | Tier    | Window                      | Limit                                   | Counts                       |
//! |---------|-----------------------------|-----------------------------------------|------------------------------|
//! | hourly  | rolling 1h (or override)    | `rate_limit_per_hour` (or override)     | this key (endpoint if overridden) |
//! | burst   | rolling 1m                  | `min(100, rate_limit_per_hour / 60)`    | this key                     |
//! | global  | rolling 1m                  | system ceiling                          | every key (tenant if set)    |
//! | monthly | calendar month (UTC)        | `monthly_quota`                         | this key                     |
//!
//! Counts are read live from the ledger on each request with no locking, so
//! concurrent requests right at a boundary may all be admitted. Every tier is
//! always computed so the response headers can be filled in.

use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::api_key::ApiKey;
use crate::models::usage::UsageQuery;
use crate::store::UsageLedger;

const HOUR_SECS: i64 = 3600;
const MINUTE_SECS: i64 = 60;
const MAX_BURST_LIMIT: i64 = 100;

/// Stricter limits for expensive endpoints, matched by path prefix.
pub const ENDPOINT_LIMITS: &[EndpointLimit] = &[
    EndpointLimit {
        path: "/api/v1/tickets/purchase",
        limit: 10,
        window_secs: 60,
    },
    EndpointLimit {
        path: "/api/v1/orders",
        limit: 100,
        window_secs: HOUR_SECS,
    },
    EndpointLimit {
        path: "/api/v1/analytics",
        limit: 50,
        window_secs: HOUR_SECS,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointLimit {
    pub path: &'static str,
    pub limit: i64,
    pub window_secs: i64,
}

/// Longest matching override for `endpoint`, if any.
pub fn endpoint_limit(endpoint: &str) -> Option<&'static EndpointLimit> {
    ENDPOINT_LIMITS
        .iter()
        .filter(|l| endpoint.starts_with(l.path))
        .max_by_key(|l| l.path.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitTier {
    Hourly,
    Burst,
    Global,
    Monthly,
}

impl RateLimitTier {
    pub fn error_code(&self) -> &'static str {
        match self {
            RateLimitTier::Hourly => "rate_limit_exceeded",
            RateLimitTier::Burst => "burst_limit_exceeded",
            RateLimitTier::Global => "global_rate_limit_exceeded",
            RateLimitTier::Monthly => "quota_exceeded",
        }
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RateLimitTier::Hourly => "Hourly",
            RateLimitTier::Burst => "Burst",
            RateLimitTier::Global => "Global",
            RateLimitTier::Monthly => "Monthly",
        })
    }
}

/// Result of evaluating one tier.
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub tier: RateLimitTier,
    pub allowed: bool,
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<i64>,
}

impl TierStatus {
    fn new(
        tier: RateLimitTier,
        limit: i64,
        used: i64,
        reset_at: DateTime<Utc>,
        retry_after_secs: i64,
    ) -> Self {
        let allowed = used < limit;
        Self {
            tier,
            allowed,
            limit,
            used,
            remaining: (limit - used).max(0),
            reset_at,
            retry_after_secs: (!allowed).then_some(retry_after_secs),
        }
    }

    fn to_error(&self) -> AppError {
        let retry_after_secs = self.retry_after_secs.unwrap_or(MINUTE_SECS);
        match self.tier {
            RateLimitTier::Monthly => AppError::QuotaExceeded {
                used: self.used,
                limit: self.limit,
                reset_at: self.reset_at,
                retry_after_secs,
            },
            tier => AppError::RateLimited {
                tier,
                limit: self.limit,
                retry_after_secs,
            },
        }
    }
}

/// All four tiers for one request.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub hourly: TierStatus,
    pub burst: TierStatus,
    pub global: TierStatus,
    pub monthly: TierStatus,
}

impl RateLimitStatus {
    /// First exhausted rate tier, in precedence order hourly, burst, global.
    pub fn rate_violation(&self) -> Option<AppError> {
        [&self.hourly, &self.burst, &self.global]
            .into_iter()
            .find(|tier| !tier.allowed)
            .map(TierStatus::to_error)
    }

    pub fn quota_violation(&self) -> Option<AppError> {
        (!self.monthly.allowed).then(|| self.monthly.to_error())
    }

    /// Write the rate limit headers onto a response.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let values = [
            ("x-ratelimit-limit", self.hourly.limit),
            ("x-ratelimit-remaining", self.hourly.remaining),
            ("x-ratelimit-reset", self.hourly.reset_at.timestamp()),
            ("x-ratelimit-burst-limit", self.burst.limit),
            ("x-ratelimit-burst-remaining", self.burst.remaining),
            ("x-monthly-quota-limit", self.monthly.limit),
            ("x-monthly-quota-remaining", self.monthly.remaining),
            ("x-monthly-quota-used", self.monthly.used),
        ];

        for (name, value) in values {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        }
    }
}

/// Evaluates the four tiers for an API key.
#[derive(Clone)]
pub struct RateLimiter {
    ledger: Arc<dyn UsageLedger>,
    global_limit_per_minute: i64,
}

impl RateLimiter {
    pub fn new(ledger: Arc<dyn UsageLedger>, global_limit_per_minute: i64) -> Self {
        Self {
            ledger,
            global_limit_per_minute,
        }
    }

    /// Compute every tier at `now`. The four ledger counts run concurrently.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Supplies the hourly limit, monthly quota and key id
    /// * `endpoint` - Request path; selects an `ENDPOINT_LIMITS` override
    ///   for the hourly tier when one matches
    /// * `tenant_id` - Narrows the global tier to one tenant when set
    /// * `now` - End of every window
    ///
    /// # Errors
    ///
    /// Returns the ledger's error if any count fails, or `AppError::Internal`
    /// if the month boundaries cannot be computed. Exhausted tiers are not
    /// errors; check `rate_violation` and `quota_violation` on the result.
    pub async fn evaluate(
        &self,
        api_key: &ApiKey,
        endpoint: Option<&str>,
        tenant_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<RateLimitStatus, AppError> {
        let (hourly_limit, hourly_window, hourly_endpoint) =
            match endpoint.and_then(endpoint_limit) {
                Some(l) => (l.limit, l.window_secs, Some(l.path.to_string())),
                None => (i64::from(api_key.rate_limit_per_hour), HOUR_SECS, None),
            };

        let (month_start, next_month) = month_bounds(now)?;

        let hourly_query = UsageQuery {
            endpoint: hourly_endpoint,
            ..UsageQuery::for_key(api_key.id, now - Duration::seconds(hourly_window), now)
        };
        let burst_query = UsageQuery::for_key(api_key.id, now - Duration::seconds(MINUTE_SECS), now);
        let global_query = UsageQuery {
            api_key_id: None,
            endpoint: None,
            tenant_id,
            from: now - Duration::seconds(MINUTE_SECS),
            to: now,
        };
        let monthly_query = UsageQuery::for_key(api_key.id, month_start, now);

        let (hourly_used, burst_used, global_used, monthly_used) = tokio::try_join!(
            self.ledger.count(&hourly_query),
            self.ledger.count(&burst_query),
            self.ledger.count(&global_query),
            self.ledger.count(&monthly_query),
        )?;

        Ok(RateLimitStatus {
            hourly: TierStatus::new(
                RateLimitTier::Hourly,
                hourly_limit,
                hourly_used,
                now + Duration::seconds(hourly_window),
                hourly_window,
            ),
            burst: TierStatus::new(
                RateLimitTier::Burst,
                burst_limit(api_key.rate_limit_per_hour),
                burst_used,
                now + Duration::seconds(MINUTE_SECS),
                MINUTE_SECS,
            ),
            global: TierStatus::new(
                RateLimitTier::Global,
                self.global_limit_per_minute,
                global_used,
                now + Duration::seconds(MINUTE_SECS),
                MINUTE_SECS,
            ),
            monthly: TierStatus::new(
                RateLimitTier::Monthly,
                api_key.monthly_quota,
                monthly_used,
                next_month,
                (next_month - now).num_seconds().max(1),
            ),
        })
    }
}

/// Requests allowed per minute for a given hourly limit: `min(100, floor(h / 60))`.
///
/// Keys with fewer than 60 requests an hour get a burst limit of 0 and are
/// denied on the burst tier.
pub fn burst_limit(rate_limit_per_hour: i32) -> i64 {
    (i64::from(rate_limit_per_hour) / 60).clamp(0, MAX_BURST_LIMIT)
}

/// Midnight UTC on the 1st of `now`'s month and of the following month.
pub fn month_bounds(now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), AppError> {
    let start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| anyhow::anyhow!("cannot compute start of month for {now}"))?;
    let next = start
        .checked_add_months(Months::new(1))
        .ok_or_else(|| anyhow::anyhow!("cannot compute start of next month for {now}"))?;

    Ok((Utc.from_utc_datetime(&start), Utc.from_utc_datetime(&next)))
}
