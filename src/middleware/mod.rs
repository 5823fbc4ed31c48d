//! HTTP middleware components.

/// API gateway admission pipeline
pub mod gateway;
