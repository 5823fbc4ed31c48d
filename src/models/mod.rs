//! Data models representing database entities.

/// API key (credential) model
pub mod api_key;
/// Usage ledger records
pub mod usage;
