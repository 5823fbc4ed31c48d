//! Application configuration management.
//!
//! Configuration is read from environment variables (optionally seeded from a
//! `.env` file) and deserialized with `envy`.

use serde::Deserialize;

use crate::services::api_key_service::ApiKeyPolicy;

/// Deployment environment. Anything other than production runs the gateway
/// in relaxed mode, which also accepts `?api_key=` query credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    Production,
    Development,
}

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `SERVER_PORT`: HTTP server port, defaults to 3000
/// - `DATABASE_MAX_CONNECTIONS`: pool size, defaults to 5
/// - `APP_ENV`: `production` (default) or `development`
/// - `BCRYPT_COST`: work factor for new key hashes, defaults to 12
/// - `GLOBAL_RATE_LIMIT_PER_MINUTE`: system-wide ceiling, defaults to 10000
/// - `PUBLIC_PATHS`: comma-separated path prefixes that bypass the gateway
/// - `DEFAULT_RATE_LIMIT_PER_HOUR` / `DEFAULT_MONTHLY_QUOTA`: limits for new keys
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    #[serde(default = "default_app_env")]
    pub app_env: AppEnv,

    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    #[serde(default = "default_global_rate_limit")]
    pub global_rate_limit_per_minute: i64,

    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,

    #[serde(default = "default_rate_limit_per_hour")]
    pub default_rate_limit_per_hour: i32,

    #[serde(default = "default_monthly_quota")]
    pub default_monthly_quota: i64,
}

fn default_port() -> u16 {
    3000
}

fn default_max_connections() -> u32 {
    5
}

fn default_app_env() -> AppEnv {
    AppEnv::Production
}

fn default_bcrypt_cost() -> u32 {
    12
}

fn default_global_rate_limit() -> i64 {
    10_000
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

fn default_rate_limit_per_hour() -> i32 {
    1000
}

fn default_monthly_quota() -> i64 {
    100_000
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is missing or a value cannot be
    /// parsed into its expected type.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env::<Config>()
    }

    /// Whether query-string credentials are accepted.
    pub fn relaxed_mode(&self) -> bool {
        self.app_env != AppEnv::Production
    }

    /// Hashing cost and default limits applied to newly issued keys.
    pub fn api_key_policy(&self) -> ApiKeyPolicy {
        ApiKeyPolicy {
            bcrypt_cost: self.bcrypt_cost,
            default_rate_limit_per_hour: self.default_rate_limit_per_hour,
            default_monthly_quota: self.default_monthly_quota,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_apply() {
        let config: Config =
            envy::from_iter(vars(&[("DATABASE_URL", "postgres://localhost/gateway")])).unwrap();

        assert_eq!(config.server_port, 3000);
        assert_eq!(config.app_env, AppEnv::Production);
        assert!(!config.relaxed_mode());
        assert_eq!(config.public_paths, vec!["/health".to_string()]);
        assert_eq!(config.global_rate_limit_per_minute, 10_000);
    }

    #[test]
    fn test_development_and_public_paths() {
        let config: Config = envy::from_iter(vars(&[
            ("DATABASE_URL", "postgres://localhost/gateway"),
            ("APP_ENV", "development"),
            ("PUBLIC_PATHS", "/health,/api/v1/docs"),
        ]))
        .unwrap();

        assert!(config.relaxed_mode());
        assert_eq!(config.public_paths, vec!["/health", "/api/v1/docs"]);
    }

    #[test]
    fn test_key_policy_follows_environment() {
        let config: Config = envy::from_iter(vars(&[
            ("DATABASE_URL", "postgres://localhost/gateway"),
            ("BCRYPT_COST", "10"),
            ("DEFAULT_RATE_LIMIT_PER_HOUR", "240"),
        ]))
        .unwrap();

        let policy = config.api_key_policy();
        assert_eq!(policy.bcrypt_cost, 10);
        assert_eq!(policy.default_rate_limit_per_hour, 240);
        assert_eq!(policy.default_monthly_quota, 100_000);
    }

    #[test]
    fn test_missing_database_url_fails() {
        assert!(envy::from_iter::<_, Config>(vars(&[("SERVER_PORT", "8080")])).is_err());
    }
}
