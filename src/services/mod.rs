//! Business logic services.
//!
//! Services contain the gateway's core logic, separated from HTTP handlers
//! and from the storage backends.

pub mod access_policy;
pub mod api_key_service;
pub mod authenticator;
pub mod rate_limiter;
pub mod usage_recorder;
