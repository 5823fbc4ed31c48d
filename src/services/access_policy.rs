//! Access policy evaluation for resolved API keys.
//!
//! Checks run in a fixed order and stop at the first failure:
//! permission, scope, IP allowlist, referrer domain.

use std::fmt;

use url::Url;

use crate::models::api_key::{ApiKey, Permission};

/// The check that rejected a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    MissingPermission(Permission),
    ScopeNotAllowed(String),
    IpNotAllowed(String),
    DomainNotAllowed(String),
}

impl PolicyViolation {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyViolation::MissingPermission(_) => "insufficient_permissions",
            PolicyViolation::ScopeNotAllowed(_) => "scope_not_allowed",
            PolicyViolation::IpNotAllowed(_) => "ip_not_allowed",
            PolicyViolation::DomainNotAllowed(_) => "domain_not_allowed",
        }
    }
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyViolation::MissingPermission(p) => {
                write!(f, "permission check failed: '{p}' permission required")
            }
            PolicyViolation::ScopeNotAllowed(endpoint) => {
                write!(f, "scope check failed: endpoint {endpoint} is outside the key's scopes")
            }
            PolicyViolation::IpNotAllowed(ip) => {
                write!(f, "IP check failed: IP address {ip} is not allowlisted")
            }
            PolicyViolation::DomainNotAllowed(host) => {
                write!(f, "domain check failed: referrer domain {host} is not allowlisted")
            }
        }
    }
}

/// Request attributes the policy is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub required: &'a [Permission],
    pub endpoint: &'a str,
    pub client_ip: Option<&'a str>,
    pub referrer: Option<&'a str>,
}

/// Run all checks in order.
pub fn evaluate(api_key: &ApiKey, request: &AccessRequest<'_>) -> Result<(), PolicyViolation> {
    check_permissions(api_key, request.required)?;
    check_scope(api_key, request.endpoint)?;
    check_ip(api_key, request.client_ip)?;
    check_referrer(api_key, request.referrer)?;
    Ok(())
}

/// Every required permission must be held, unless the key is admin.
pub fn check_permissions(api_key: &ApiKey, required: &[Permission]) -> Result<(), PolicyViolation> {
    if api_key.permissions.is_admin() {
        return Ok(());
    }

    match required
        .iter()
        .find(|permission| !api_key.permissions.contains(**permission))
    {
        Some(missing) => Err(PolicyViolation::MissingPermission(*missing)),
        None => Ok(()),
    }
}

pub fn check_scope(api_key: &ApiKey, endpoint: &str) -> Result<(), PolicyViolation> {
    if api_key.scopes.is_empty() || api_key.scopes.iter().any(|s| scope_matches(s, endpoint)) {
        Ok(())
    } else {
        Err(PolicyViolation::ScopeNotAllowed(endpoint.to_string()))
    }
}

/// Exact match, or `prefix*` matching any endpoint starting with `prefix`.
pub fn scope_matches(scope: &str, endpoint: &str) -> bool {
    match scope.strip_suffix('*') {
        Some(prefix) => endpoint.starts_with(prefix),
        None => scope == endpoint,
    }
}

/// An unknown client IP never satisfies a configured allowlist.
pub fn check_ip(api_key: &ApiKey, client_ip: Option<&str>) -> Result<(), PolicyViolation> {
    if api_key.allowed_ips.is_empty() {
        return Ok(());
    }

    match client_ip {
        Some(ip) if api_key.allowed_ips.iter().any(|allowed| allowed == ip) => Ok(()),
        Some(ip) => Err(PolicyViolation::IpNotAllowed(ip.to_string())),
        None => Err(PolicyViolation::IpNotAllowed("unknown".to_string())),
    }
}

/// Referrers that are absent or do not parse as URLs are not checked.
pub fn check_referrer(api_key: &ApiKey, referrer: Option<&str>) -> Result<(), PolicyViolation> {
    if api_key.allowed_domains.is_empty() {
        return Ok(());
    }

    let Some(host) = referrer
        .and_then(|r| Url::parse(r).ok())
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
    else {
        return Ok(());
    };

    if api_key
        .allowed_domains
        .iter()
        .any(|domain| domain_matches(domain, &host))
    {
        Ok(())
    } else {
        Err(PolicyViolation::DomainNotAllowed(host))
    }
}

/// `*.example.com` matches `shop.example.com` but not `example.com` itself.
pub fn domain_matches(allowed: &str, host: &str) -> bool {
    let allowed = allowed.to_ascii_lowercase();
    match allowed.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') => host.ends_with(suffix),
        _ => allowed == host,
    }
}
