use std::sync::Arc;

use relaunch_engine::DockerConnector;
use relaunch_gateway_server::{config::ServerConfig, create_app, AppState};
use relaunch_orchestrator::UpdateOrchestrator;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str =
    "info,relaunch_gateway_server=debug,relaunch_orchestrator=debug,relaunch_engine=debug";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();

    let config = ServerConfig::from_env()?;
    info!(
        host = ?config.engine.host,
        tls = config.engine.tls.is_some(),
        batch_timeout_secs = config.orchestrator.batch_timeout.as_secs(),
        "Configuration loaded"
    );

    // Credentials are read on every notification, not here.
    let connector = Arc::new(DockerConnector::new(config.engine.clone()));
    let orchestrator = UpdateOrchestrator::new(connector, config.orchestrator.clone());
    let app = create_app(AppState::new(orchestrator, config.token.as_str()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "relaunch listening for push notifications");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("relaunch stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
