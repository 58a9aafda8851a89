use flarewatch_core::dashboard::{DashboardConfig, DashboardServer};
use flarewatch_core::{
    Aggregator, Credentials, LogStreamManager, QueryEngine, StreamConfig, TelemetryBackend,
    TelemetryClient, TelemetryConfig,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,flarewatch_core=info,flarewatch_server=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    // Credentials are required up front; telemetry calls are never attempted
    // unauthenticated.
    let credentials = match Credentials::from_env() {
        Ok(credentials) => credentials,
        Err(e) => {
            error!(target: "server", error = %e, "Cannot start without telemetry credentials");
            return Err(e.into());
        }
    };

    let backend: Arc<dyn TelemetryBackend> = Arc::new(TelemetryClient::new(
        credentials,
        TelemetryConfig::default(),
    ));
    let engine = Arc::new(QueryEngine::new(Arc::clone(&backend)));
    let streams = Arc::new(LogStreamManager::new(
        Arc::clone(&engine),
        StreamConfig::default(),
    ));
    let aggregator = Arc::new(Aggregator::new(Arc::clone(&backend)));

    let config = DashboardConfig::from_env();
    info!(
        target: "server",
        host = %config.host,
        port = config.port,
        "Starting Flarewatch dashboard"
    );

    let server = DashboardServer::new(config, engine, streams, aggregator, backend);

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!(target: "server", error = %e, "Dashboard server exited with error");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(target: "server", "Shutdown signal received");
        }
    }

    Ok(())
}
