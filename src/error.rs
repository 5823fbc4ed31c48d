//! Error types and HTTP error response handling.
//!
//! This module defines all application errors and how they are converted
//! into HTTP responses with appropriate status codes and JSON bodies.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::services::access_policy::PolicyViolation;
use crate::services::rate_limiter::RateLimitTier;

/// Application-wide error type.
///
/// The four admission failures (`Unauthenticated`, `Forbidden`,
/// `RateLimited`, `QuotaExceeded`) are returned to the caller unchanged.
/// Store failures are logged and hidden behind a generic 500.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Any other internal failure (blocking task panics, calendar overflow, ...).
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    /// API key is missing, malformed, unknown, inactive or expired.
    ///
    /// Deliberately a single variant so callers cannot tell the cases apart.
    #[error("Invalid or missing API key")]
    Unauthenticated,

    /// The key is valid but one of the access policy checks failed.
    #[error("Access denied: {0}")]
    Forbidden(PolicyViolation),

    /// An hourly, burst or global tier is exhausted.
    #[error("{tier} rate limit exceeded: {limit} requests allowed, retry after {retry_after_secs} seconds")]
    RateLimited {
        tier: RateLimitTier,
        limit: i64,
        retry_after_secs: i64,
    },

    /// The monthly request quota is exhausted.
    #[error(
        "Monthly quota exceeded: {used}/{limit} requests used, resets on {}",
        .reset_at.format("%Y-%m-%d")
    )]
    QuotaExceeded {
        used: i64,
        limit: i64,
        reset_at: DateTime<Utc>,
        retry_after_secs: i64,
    },

    /// Requested API key does not exist.
    #[error("API key not found")]
    ApiKeyNotFound,

    /// Request body or parameters are invalid.
    #[error("Invalid request")]
    InvalidRequest(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } | AppError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::ApiKeyNotFound => StatusCode::NOT_FOUND,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "unauthenticated",
            AppError::Forbidden(violation) => violation.code(),
            AppError::RateLimited { tier, .. } => tier.error_code(),
            AppError::QuotaExceeded { .. } => "quota_exceeded",
            AppError::ApiKeyNotFound => "api_key_not_found",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::Database(_) | AppError::Internal(_) => "internal_error",
        }
    }

    /// Seconds the caller should wait before retrying, for 429 responses.
    pub fn retry_after_secs(&self) -> Option<i64> {
        match self {
            AppError::RateLimited {
                retry_after_secs, ..
            }
            | AppError::QuotaExceeded {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// ```json
/// {
///   "error": {
///     "code": "error_type",
///     "message": "Human-readable error message"
///   }
/// }
/// ```
///
/// 429 responses also carry a `Retry-After` header.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            AppError::InvalidRequest(msg) => msg.clone(),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "An internal error occurred".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": {
                "code": self.code(),
                "message": message
            }
        });

        if let AppError::QuotaExceeded {
            used,
            limit,
            reset_at,
            ..
        } = &self
        {
            body["error"]["used"] = json!(used);
            body["error"]["limit"] = json!(limit);
            body["error"]["reset_date"] = json!(reset_at);
        }

        let mut response = (status, Json(body)).into_response();

        if let Some(secs) = self.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }

        response
    }
}
