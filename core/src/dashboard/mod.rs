// Dashboard module - HTTP API for the monitoring UI
//
// Serves the log query, live stream, worker directory and aggregate
// snapshot endpoints consumed by the dashboard pages.

mod api;

pub use api::{DashboardServer, HealthStatus, WorkerWithMetrics};

/// Dashboard server configuration
#[derive(Clone, Debug)]
pub struct DashboardConfig {
    pub port: u16,
    pub host: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            port: 3030,
            host: "127.0.0.1".to_string(),
        }
    }
}

impl DashboardConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("FLAREWATCH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3030),
            host: std::env::var("FLAREWATCH_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        }
    }
}
