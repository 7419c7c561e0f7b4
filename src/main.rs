use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use activity_sync::api::{self, AppState};
use activity_sync::config::AppConfig;
use activity_sync::database::Database;
use activity_sync::github::HttpGraphClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "activity_sync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting activity sync service");

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!(organization = %config.organization, "Configuration loaded");

    let database = Database::new(&config.database_url)
        .await
        .context("Failed to open database")?;

    let client = HttpGraphClient::new(config.graphql_url.clone(), config.github_token.clone())
        .context("Failed to build GraphQL client")?;
    let (orchestrator, realigner) =
        activity_sync::build_engine(&config, database, Arc::new(client));

    match orchestrator.restore_schedule().await {
        Ok(true) => info!("Automatic sync schedule restored"),
        Ok(false) => info!("Automatic sync not enabled"),
        Err(e) => error!("Failed to restore automatic sync schedule: {}", e),
    }

    let app = api::router(AppState {
        orchestrator,
        realigner,
    });

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("Invalid server address")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
