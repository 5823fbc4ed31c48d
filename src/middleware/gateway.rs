//! Gateway admission pipeline.
//!
//! Every request that is not on a public path goes through, in order:
//!
//! 1. Authentication (`Unauthenticated` / 401)
//! 2. Access policy: permission, scope, IP, referrer (`Forbidden` / 403)
//! 3. Hourly, burst and global rate tiers (`RateLimited` / 429)
//! 4. Monthly quota (`QuotaExceeded` / 429)
//!
//! The first failing step ends the pipeline. Once a key has been resolved the
//! attempt is metered whether it is admitted or not; requests that never
//! resolve a key are not metered. Rate limit headers are attached to every
//! response for which the tiers were evaluated.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::AppState;
use crate::error::AppError;
use crate::models::api_key::{ApiKey, Permission, PermissionSet};
use crate::models::usage::{NewUsageRecord, UsageOutcome};
use crate::services::access_policy::{self, AccessRequest};
use crate::services::authenticator::{ApiKeyAuthenticator, extract_api_key};
use crate::services::rate_limiter::{RateLimitStatus, RateLimiter};
use crate::services::usage_recorder::{UsageRecorder, sanitize_headers, sanitize_query};
use crate::store::{CredentialStore, UsageLedger};

/// Authentication context attached to admitted requests.
///
/// Handlers extract it with `Extension<AuthContext>`.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key_id: Uuid,
    pub name: String,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub permissions: PermissionSet,
    pub scopes: Vec<String>,
    pub rate_limit_per_hour: i32,
    pub monthly_quota: i64,
}

impl From<&ApiKey> for AuthContext {
    fn from(api_key: &ApiKey) -> Self {
        Self {
            api_key_id: api_key.id,
            name: api_key.name.clone(),
            tenant_id: api_key.tenant_id,
            user_id: api_key.user_id,
            permissions: api_key.permissions.clone(),
            scopes: api_key.scopes.clone(),
            rate_limit_per_hour: api_key.rate_limit_per_hour,
            monthly_quota: api_key.monthly_quota,
        }
    }
}

/// Deployment-level knobs for the pipeline.
///
/// Per-key limits live on the key itself; these apply to every request.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Accept `?api_key=` credentials in addition to the Authorization and
    /// X-API-Key headers. Off in production.
    pub relaxed_mode: bool,
    /// Paths admitted without any checks and never metered. An entry covers
    /// itself and anything below it at a `/` boundary.
    pub public_paths: Vec<String>,
    /// Ceiling on root usage records per rolling minute across all keys
    /// (or within a tenant, for tenant-bound keys).
    pub global_rate_limit_per_minute: i64,
}

/// Pipeline step a request was rejected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStage {
    Authenticating,
    PolicyChecking,
    RateChecking,
    QuotaChecking,
}

impl fmt::Display for GatewayStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GatewayStage::Authenticating => "authenticating",
            GatewayStage::PolicyChecking => "policy_checking",
            GatewayStage::RateChecking => "rate_checking",
            GatewayStage::QuotaChecking => "quota_checking",
        })
    }
}

/// The parts of an inbound request the pipeline looks at.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Socket peer address, used when no `X-Forwarded-For` is present
    pub peer_ip: Option<IpAddr>,
}

impl GatewayRequest {
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap, peer_ip: Option<IpAddr>) -> Self {
        Self {
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers,
            peer_ip,
        }
    }

    /// First `X-Forwarded-For` entry, else the peer address.
    pub fn client_ip(&self) -> Option<String> {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .or_else(|| self.peer_ip.map(|ip| ip.to_string()))
    }

    pub fn referrer(&self) -> Option<&str> {
        self.header("referer").or_else(|| self.header("origin"))
    }

    /// Permission implied by the HTTP method.
    pub fn required_permission(&self) -> Permission {
        match self.method {
            Method::POST | Method::PUT | Method::PATCH => Permission::Write,
            Method::DELETE => Permission::Delete,
            _ => Permission::Read,
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// An admitted request, carrying what the response side needs.
#[derive(Debug)]
pub struct Admitted {
    pub api_key: ApiKey,
    pub limits: RateLimitStatus,
    /// Root usage record already queued for this request
    pub usage: NewUsageRecord,
    started: Instant,
}

/// A rejected request.
#[derive(Debug)]
pub struct Denied {
    pub stage: GatewayStage,
    pub error: AppError,
    /// Present once the key was resolved
    pub api_key_id: Option<Uuid>,
    /// Present when the rate tiers were evaluated
    pub limits: Option<RateLimitStatus>,
}

impl IntoResponse for Denied {
    fn into_response(self) -> Response {
        let limits = self.limits;
        let mut response = self.error.into_response();
        if let Some(limits) = limits {
            limits.apply_headers(response.headers_mut());
        }
        response
    }
}

#[derive(Debug)]
pub enum Admission {
    /// Public path, no checks ran
    Bypassed,
    Admitted(Box<Admitted>),
    Denied(Box<Denied>),
}

/// Sequences authentication, policy, rate and quota checks for each request.
///
/// Holds no per-request state; the only shared bookkeeping is the usage
/// recorder's in-flight counter.
pub struct Gateway {
    authenticator: ApiKeyAuthenticator,
    limiter: RateLimiter,
    recorder: UsageRecorder,
    settings: GatewaySettings,
}

impl Gateway {
    /// Build a gateway over the given stores.
    ///
    /// # Arguments
    ///
    /// * `settings` - Public paths, relaxed mode and the global ceiling
    /// * `credentials` - Where API keys are looked up (and lazily expired)
    /// * `ledger` - Shared by the rate limiter (counts) and the usage
    ///   recorder (appends), so admitted requests count against later ones
    pub fn new(
        settings: GatewaySettings,
        credentials: Arc<dyn CredentialStore>,
        ledger: Arc<dyn UsageLedger>,
    ) -> Self {
        Self {
            authenticator: ApiKeyAuthenticator::new(credentials),
            limiter: RateLimiter::new(ledger.clone(), settings.global_rate_limit_per_minute),
            recorder: UsageRecorder::new(ledger),
            settings,
        }
    }

    pub fn recorder(&self) -> &UsageRecorder {
        &self.recorder
    }

    fn is_public(&self, path: &str) -> bool {
        self.settings
            .public_paths
            .iter()
            .any(|prefix| covers_path(prefix, path))
    }

    /// Run the pipeline for one request.
    ///
    /// # Steps
    ///
    /// 1. Public path: `Bypassed`, nothing else runs
    /// 2. Extract and authenticate the key; failures are not metered
    /// 3. Access policy, rate tiers and quota, stopping at the first failure
    /// 4. Queue the root usage record, admitted or denied
    ///
    /// Never fails: store errors during evaluation come back as a `Denied`
    /// carrying `AppError::Database` / `AppError::Internal`.
    pub async fn admit(&self, request: &GatewayRequest) -> Admission {
        let started = Instant::now();

        if self.is_public(&request.path) {
            return Admission::Bypassed;
        }

        let now = Utc::now();
        let Some(raw_key) = extract_api_key(
            &request.headers,
            request.query.as_deref(),
            self.settings.relaxed_mode,
        ) else {
            tracing::debug!(endpoint = %request.path, "request without API key");
            return Admission::Denied(Box::new(Denied {
                stage: GatewayStage::Authenticating,
                error: AppError::Unauthenticated,
                api_key_id: None,
                limits: None,
            }));
        };

        let api_key = match self.authenticator.authenticate(&raw_key, now).await {
            Ok(api_key) => api_key,
            Err(error) => {
                tracing::warn!(endpoint = %request.path, "API key authentication failed: {}", error);
                return Admission::Denied(Box::new(Denied {
                    stage: GatewayStage::Authenticating,
                    error,
                    api_key_id: None,
                    limits: None,
                }));
            }
        };

        match self.check(&api_key, request, now).await {
            Ok(limits) => {
                let usage = usage_record(&api_key, request, StatusCode::OK, None, started);
                self.recorder.record(usage.clone());

                Admission::Admitted(Box::new(Admitted {
                    api_key,
                    limits,
                    usage,
                    started,
                }))
            }
            Err((stage, error, limits)) => {
                tracing::warn!(
                    api_key_id = %api_key.id,
                    endpoint = %request.path,
                    stage = %stage,
                    "request denied: {}",
                    error
                );
                let usage = usage_record(
                    &api_key,
                    request,
                    error.status_code(),
                    Some(error.to_string()),
                    started,
                );
                self.recorder.record(usage);

                Admission::Denied(Box::new(Denied {
                    stage,
                    error,
                    api_key_id: Some(api_key.id),
                    limits,
                }))
            }
        }
    }

    /// Policy, rate and quota checks for a resolved key.
    async fn check(
        &self,
        api_key: &ApiKey,
        request: &GatewayRequest,
        now: DateTime<Utc>,
    ) -> Result<RateLimitStatus, (GatewayStage, AppError, Option<RateLimitStatus>)> {
        let client_ip = request.client_ip();
        let access = AccessRequest {
            required: &[request.required_permission()],
            endpoint: &request.path,
            client_ip: client_ip.as_deref(),
            referrer: request.referrer(),
        };
        access_policy::evaluate(api_key, &access)
            .map_err(|v| (GatewayStage::PolicyChecking, AppError::Forbidden(v), None))?;

        let limits = self
            .limiter
            .evaluate(api_key, Some(&request.path), api_key.tenant_id, now)
            .await
            .map_err(|e| (GatewayStage::RateChecking, e, None))?;

        if let Some(error) = limits.rate_violation() {
            return Err((GatewayStage::RateChecking, error, Some(limits)));
        }
        if let Some(error) = limits.quota_violation() {
            return Err((GatewayStage::QuotaChecking, error, Some(limits)));
        }

        Ok(limits)
    }

    /// Queue the superseding usage record once the response is known.
    pub fn complete(&self, admitted: &Admitted, status: StatusCode, response_size: Option<i64>) {
        let record = admitted.usage.superseded_by(
            status.as_u16(),
            elapsed_ms(admitted.started),
            response_size,
            None,
        );
        self.recorder.record(record);
    }
}

fn usage_record(
    api_key: &ApiKey,
    request: &GatewayRequest,
    status: StatusCode,
    error_message: Option<String>,
    started: Instant,
) -> NewUsageRecord {
    let header = |name: &str| {
        request
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    NewUsageRecord {
        id: Uuid::new_v4(),
        api_key_id: api_key.id,
        tenant_id: api_key.tenant_id,
        user_id: api_key.user_id,
        endpoint: request.path.clone(),
        method: request.method.to_string(),
        status_code: status.as_u16(),
        outcome: UsageOutcome::classify(status.as_u16(), error_message.as_deref()),
        response_time_ms: elapsed_ms(started),
        request_size: content_length(&request.headers),
        response_size: None,
        ip_address: request.client_ip(),
        user_agent: header("user-agent"),
        referrer: request.referrer().map(str::to_string),
        headers: sanitize_headers(&request.headers),
        query_params: sanitize_query(request.query.as_deref()),
        error_message,
        supersedes_id: None,
    }
}

/// `prefix` covers `path` when they are equal or `path` continues past it at a
/// `/` boundary, so `/health` covers `/health/live` but not `/healthcheck`.
fn covers_path(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn content_length(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Axum middleware running the gateway pipeline.
///
/// On admission the `AuthContext` and the evaluated `RateLimitStatus` are
/// inserted into the request extensions for downstream handlers.
pub async fn gateway_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let gateway_request = GatewayRequest::new(
        request.method().clone(),
        request.uri(),
        request.headers().clone(),
        peer_ip,
    );

    match state.gateway.admit(&gateway_request).await {
        Admission::Bypassed => next.run(request).await,
        Admission::Denied(denied) => (*denied).into_response(),
        Admission::Admitted(admitted) => {
            request
                .extensions_mut()
                .insert(AuthContext::from(&admitted.api_key));
            request.extensions_mut().insert(admitted.limits.clone());

            let mut response = next.run(request).await;
            admitted.limits.apply_headers(response.headers_mut());
            state
                .gateway
                .complete(&admitted, response.status(), content_length(response.headers()));
            response
        }
    }
}
