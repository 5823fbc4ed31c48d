//! API key (credential) model.
//!
//! API keys authenticate callers of the public API. Only a bcrypt hash of the
//! secret is persisted, together with the first 8 characters of the plaintext
//! (`key_prefix`) which narrows the candidate set during authentication.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when a stored status or permission string is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle state of an API key.
///
/// Only `Active` keys are considered during authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Inactive,
    Revoked,
    Expired,
}

impl ApiKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyStatus::Active => "active",
            ApiKeyStatus::Inactive => "inactive",
            ApiKeyStatus::Revoked => "revoked",
            ApiKeyStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ApiKeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiKeyStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ApiKeyStatus::Active),
            "inactive" => Ok(ApiKeyStatus::Inactive),
            "revoked" => Ok(ApiKeyStatus::Revoked),
            "expired" => Ok(ApiKeyStatus::Expired),
            other => Err(ParseEnumError::new("status", other)),
        }
    }
}

impl TryFrom<String> for ApiKeyStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Operation class an API key may be granted.
///
/// `Admin` implicitly satisfies every other permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Delete => "delete",
            Permission::Admin => "admin",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "delete" => Ok(Permission::Delete),
            "admin" => Ok(Permission::Admin),
            other => Err(ParseEnumError::new("permission", other)),
        }
    }
}

/// Permission set as stored in the `permissions TEXT[]` column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(pub Vec<Permission>);

impl PermissionSet {
    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    pub fn is_admin(&self) -> bool {
        self.contains(Permission::Admin)
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|p| p.as_str().to_string()).collect()
    }
}

impl TryFrom<Vec<String>> for PermissionSet {
    type Error = ParseEnumError;

    fn try_from(values: Vec<String>) -> Result<Self, Self::Error> {
        values
            .iter()
            .map(|v| v.parse())
            .collect::<Result<Vec<_>, _>>()
            .map(PermissionSet)
    }
}

impl From<Vec<Permission>> for PermissionSet {
    fn from(permissions: Vec<Permission>) -> Self {
        PermissionSet(permissions)
    }
}

/// Represents an API key record from the database.
///
/// # Database Table
///
/// Maps to the `api_keys` table. Empty `scopes`, `allowed_ips` and
/// `allowed_domains` arrays mean "unrestricted".
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,

    /// Human-readable label chosen by the owner
    pub name: String,

    /// bcrypt hash of the full plaintext key
    pub key_hash: String,

    /// First 8 characters of the plaintext key.
    ///
    /// Not secret and not unique; it only selects candidates to verify.
    pub key_prefix: String,

    #[sqlx(try_from = "String")]
    pub status: ApiKeyStatus,

    #[sqlx(try_from = "Vec<String>")]
    pub permissions: PermissionSet,

    /// Endpoint patterns: exact strings or `prefix*` wildcards
    pub scopes: Vec<String>,

    pub allowed_ips: Vec<String>,

    /// Referrer hostnames; `*.example.com` admits any subdomain
    pub allowed_domains: Vec<String>,

    pub rate_limit_per_hour: i32,

    pub monthly_quota: i64,

    pub expires_at: Option<DateTime<Utc>>,

    pub last_used_at: Option<DateTime<Utc>>,

    /// Owning tenant (white-label organisation), if any
    pub tenant_id: Option<Uuid>,

    pub user_id: Option<Uuid>,

    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ApiKey {
    /// Whether the key's expiry has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Request body for issuing a new API key.
///
/// Limit fields fall back to the service defaults when omitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,

    #[serde(default = "default_permissions")]
    pub permissions: Vec<Permission>,

    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(default)]
    pub allowed_ips: Vec<String>,

    #[serde(default)]
    pub allowed_domains: Vec<String>,

    pub rate_limit_per_hour: Option<i32>,

    pub monthly_quota: Option<i64>,

    pub expires_at: Option<DateTime<Utc>>,

    pub tenant_id: Option<Uuid>,

    pub user_id: Option<Uuid>,

    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_permissions() -> Vec<Permission> {
    vec![Permission::Read]
}

/// Public view of an API key. Never includes the hash.
#[derive(Debug, Serialize)]
pub struct ApiKeyResponse {
    pub id: Uuid,
    pub name: String,
    pub key_prefix: String,
    pub status: ApiKeyStatus,
    pub permissions: PermissionSet,
    pub scopes: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub allowed_domains: Vec<String>,
    pub rate_limit_per_hour: i32,
    pub monthly_quota: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub tenant_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<ApiKey> for ApiKeyResponse {
    fn from(key: ApiKey) -> Self {
        Self {
            id: key.id,
            name: key.name,
            key_prefix: key.key_prefix,
            status: key.status,
            permissions: key.permissions,
            scopes: key.scopes,
            allowed_ips: key.allowed_ips,
            allowed_domains: key.allowed_domains,
            rate_limit_per_hour: key.rate_limit_per_hour,
            monthly_quota: key.monthly_quota,
            expires_at: key.expires_at,
            last_used_at: key.last_used_at,
            tenant_id: key.tenant_id,
            created_at: key.created_at,
        }
    }
}
