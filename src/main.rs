//! Ticketing API Gateway - Main Application Entry Point
//!
//! # Commands
//!
//! - `serve` (default): run the gateway
//! - `issue-admin-key --name <NAME>`: create an admin key and print it once
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool
//! 3. Run database migrations
//! 4. Build the gateway and HTTP router
//! 5. Serve until Ctrl-C / SIGTERM, then flush pending usage records

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ticketing_api_gateway::{
    AppState, app,
    config::Config,
    db,
    middleware::gateway::{Gateway, GatewaySettings},
    models::api_key::{CreateApiKeyRequest, Permission},
    services::api_key_service,
    store::postgres::{PgCredentialStore, PgUsageLedger},
};

#[derive(Parser)]
#[command(name = "api-gateway")]
#[command(about = "Ticketing API gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve,
    /// Issue an admin API key for managing other keys
    IssueAdminKey {
        /// Display name of the key
        #[arg(long)]
        name: String,
        /// Bind the key to one tenant
        #[arg(long)]
        tenant_id: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Reads RUST_LOG, defaults to "info"
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    tracing::info!(relaxed_mode = config.relaxed_mode(), "Configuration loaded");

    let pool = db::create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database pool created");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let credentials = Arc::new(PgCredentialStore::new(pool.clone()));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, credentials, PgUsageLedger::new(pool)).await,
        Commands::IssueAdminKey { name, tenant_id } => {
            let request = CreateApiKeyRequest {
                name,
                permissions: vec![Permission::Admin],
                tenant_id,
                ..Default::default()
            };
            let issued = api_key_service::create_api_key(
                credentials.as_ref(),
                &config.api_key_policy(),
                request,
            )
            .await?;

            println!("API key id: {}", issued.api_key.id);
            println!("API key:    {}", issued.key);
            println!("Store it now; it cannot be shown again.");
            Ok(())
        }
    }
}

async fn serve(
    config: Config,
    credentials: Arc<PgCredentialStore>,
    ledger: PgUsageLedger,
) -> anyhow::Result<()> {
    let gateway = Arc::new(Gateway::new(
        GatewaySettings {
            relaxed_mode: config.relaxed_mode(),
            public_paths: config.public_paths.clone(),
            global_rate_limit_per_minute: config.global_rate_limit_per_minute,
        },
        credentials.clone(),
        Arc::new(ledger),
    ));

    let state = AppState {
        gateway: gateway.clone(),
        credentials,
        key_policy: config.api_key_policy(),
    };

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // ConnectInfo gives the gateway a client IP when no X-Forwarded-For is sent
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!(pending = gateway.recorder().pending(), "Flushing usage records");
    gateway.recorder().flush().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
