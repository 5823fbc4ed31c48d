//! HTTP request handlers (route handlers).

/// Calling key introspection
pub mod api_keys;
/// Liveness and database connectivity
pub mod health;
/// Admin-only key lifecycle routes
pub mod key_admin;
