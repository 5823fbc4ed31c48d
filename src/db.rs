//! PostgreSQL pool and schema setup for the credential store and usage ledger.

use sqlx::{PgPool, postgres::PgPoolOptions};

pub type DbPool = PgPool;

/// Connect to `database_url` with at most `max_connections` connections.
///
/// A gated request holds a connection briefly for the candidate lookup, the
/// four tier counts, and each usage append.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Apply the `api_keys` and `api_usage` migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
