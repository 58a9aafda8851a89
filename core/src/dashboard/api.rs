// Dashboard HTTP API server
//
// Provides REST endpoints and SSE log streaming for the dashboard UI.
// Data-layer failures degrade to empty payloads; only request parsing
// produces an error status, and the body shape stays stable either way so
// callers can always read `.data`.

use crate::aggregate::Aggregator;
use crate::client::TelemetryBackend;
use crate::dashboard::DashboardConfig;
use crate::logs::{LogEntry, LogFilter, LogLevel};
use crate::query::QueryEngine;
use crate::stream::LogStreamManager;
use crate::WatchError;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
    routing::get,
    Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Caller-facing default query window
const DEFAULT_WINDOW_HOURS: i64 = 6;
const MAX_LOG_LIMIT: usize = 1000;
const WORKER_METRICS_WINDOW_HOURS: i64 = 24;

/// Dashboard server state
#[derive(Clone)]
struct DashboardState {
    engine: Arc<QueryEngine>,
    streams: Arc<LogStreamManager>,
    aggregator: Arc<Aggregator>,
    backend: Arc<dyn TelemetryBackend>,
}

/// Dashboard HTTP server
pub struct DashboardServer {
    config: DashboardConfig,
    state: DashboardState,
}

impl DashboardServer {
    pub fn new(
        config: DashboardConfig,
        engine: Arc<QueryEngine>,
        streams: Arc<LogStreamManager>,
        aggregator: Arc<Aggregator>,
        backend: Arc<dyn TelemetryBackend>,
    ) -> Self {
        Self {
            config,
            state: DashboardState {
                engine,
                streams,
                aggregator,
                backend,
            },
        }
    }

    /// Start the dashboard server
    pub async fn serve(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(
            target: "dashboard",
            addr = %addr,
            "Starting dashboard server"
        );

        let app = Router::new()
            .route("/api/workers", get(workers_handler))
            .route("/api/workers/health", get(workers_health_handler))
            .route("/api/workers/:name/logs", get(worker_logs_handler))
            .route("/api/logs/stream", get(log_stream_handler))
            .route("/api/aggregate", get(aggregate_handler))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .with_state(self.state);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(
            target: "dashboard",
            url = %format!("http://{}", addr),
            "Dashboard server ready"
        );

        axum::serve(listener, app).await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log query endpoint
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LogsQuery {
    level: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    limit: usize,
    search: Option<String>,
    outcome: Option<String>,
}

fn default_limit() -> usize {
    100
}

#[derive(Serialize)]
struct LogsResponse {
    success: bool,
    data: Vec<LogEntry>,
    count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Query logs for one worker, or `all` for the whole fleet.
/// Missing time bounds default to the trailing 6-hour window.
async fn worker_logs_handler(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
    Query(params): Query<LogsQuery>,
) -> impl IntoResponse {
    let until = params.until.unwrap_or_else(Utc::now);
    let since = params
        .since
        .unwrap_or_else(|| until - ChronoDuration::hours(DEFAULT_WINDOW_HOURS));

    let mut filter = LogFilter::window(since, until);
    filter.script_name = (name != "all").then_some(name);
    filter.level = match params.level.as_deref() {
        None | Some("all") => None,
        Some(level) => Some(LogLevel::parse(level)),
    };
    filter.limit = params.limit.min(MAX_LOG_LIMIT);
    filter.search = params.search;
    filter.outcome = params.outcome;

    match state.engine.query(&filter).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(LogsResponse {
                success: true,
                count: entries.len(),
                data: entries,
                error: None,
            }),
        ),
        // Only an invalid filter reaches here; upstream failures degrade
        // inside the engine.
        Err(e @ WatchError::InvalidFilter(_)) => (
            StatusCode::BAD_REQUEST,
            Json(LogsResponse {
                success: false,
                data: Vec::new(),
                count: 0,
                error: Some(e.to_string()),
            }),
        ),
        Err(e) => {
            warn!(target: "dashboard", error = %e, "Log query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(LogsResponse {
                    success: false,
                    data: Vec::new(),
                    count: 0,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Live log stream (SSE)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StreamQuery {
    script: Option<String>,
}

/// SSE endpoint tailing one worker's logs (`script=all` tails every worker).
/// One JSON-encoded entry per `data:` frame; open until client disconnect.
async fn log_stream_handler(
    State(state): State<DashboardState>,
    Query(params): Query<StreamQuery>,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    let Some(script) = params.script else {
        return Err((StatusCode::BAD_REQUEST, "missing script parameter"));
    };

    info!(target: "dashboard", script = %script, "New log stream client connected");

    let script_filter = (script != "all").then_some(script);
    let stream = state
        .streams
        .open(script_filter)
        .filter_map(|entry| match serde_json::to_string(&entry) {
            Ok(json) => Some(Ok::<_, Infallible>(Event::default().data(json))),
            Err(e) => {
                warn!(target: "dashboard", error = %e, "Failed to serialize log entry");
                None
            }
        });

    // Proxies must neither cache nor buffer a live tail
    let headers = [
        (header::CACHE_CONTROL, "no-cache, no-transform"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((headers, Sse::new(stream).keep_alive(KeepAlive::default())))
}

// ---------------------------------------------------------------------------
// Worker directory with telemetry
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    // Ordered worst-first so sorting surfaces broken workers at the top
    Error,
    Warning,
    Healthy,
}

/// Worker directory entry joined with its telemetry window
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerWithMetrics {
    pub name: String,
    pub id: String,
    pub created_on: Option<DateTime<Utc>>,
    pub modified_on: Option<DateTime<Utc>>,
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub p50_cpu_ms: f64,
    pub p99_cpu_ms: f64,
    pub p50_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub status: HealthStatus,
}

pub(crate) fn health_status(error_rate: f64) -> HealthStatus {
    if error_rate > 5.0 {
        HealthStatus::Error
    } else if error_rate > 1.0 {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

async fn fetch_workers_with_metrics(
    state: &DashboardState,
) -> crate::Result<Vec<WorkerWithMetrics>> {
    let until = Utc::now();
    let since = until - ChronoDuration::hours(WORKER_METRICS_WINDOW_HOURS);

    // Directory and telemetry fan out in parallel; a telemetry failure
    // degrades to zero metrics, the directory itself is required.
    let (workers, telemetry) = tokio::join!(
        state.backend.list_workers(),
        state.backend.query_aggregate_metrics(since, until),
    );
    let workers = workers?;
    let telemetry = telemetry.unwrap_or_else(|e| {
        warn!(target: "dashboard", error = %e, "Telemetry unavailable, listing workers without metrics");
        Vec::new()
    });

    let by_script: std::collections::HashMap<&str, _> = telemetry
        .iter()
        .map(|t| (t.script_name.as_str(), t))
        .collect();

    let mut merged: Vec<WorkerWithMetrics> = workers
        .into_iter()
        .map(|w| {
            let t = by_script.get(w.name.as_str());
            let requests = t.map_or(0, |t| t.invocations);
            let errors = t.map_or(0, |t| t.errors);
            let error_rate = if requests > 0 {
                (errors as f64 / requests as f64 * 10_000.0).round() / 100.0
            } else {
                0.0
            };

            WorkerWithMetrics {
                name: w.name,
                id: w.id,
                created_on: w.created_on,
                modified_on: w.modified_on,
                requests,
                errors,
                error_rate,
                p50_cpu_ms: t.map_or(0.0, |t| t.p50_cpu_ms),
                p99_cpu_ms: t.map_or(0.0, |t| t.p99_cpu_ms),
                p50_duration_ms: t.map_or(0.0, |t| t.p50_duration_ms),
                p99_duration_ms: t.map_or(0.0, |t| t.p99_duration_ms),
                status: health_status(error_rate),
            }
        })
        .collect();

    // Broken workers first, then busiest first
    merged.sort_by(|a, b| {
        a.status
            .cmp(&b.status)
            .then(b.requests.cmp(&a.requests))
    });

    Ok(merged)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkersResponse {
    success: bool,
    data: Vec<WorkerWithMetrics>,
    count: usize,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match fetch_workers_with_metrics(&state).await {
        Ok(workers) => (
            StatusCode::OK,
            Json(WorkersResponse {
                success: true,
                count: workers.len(),
                data: workers,
                timestamp: Utc::now(),
                error: None,
            }),
        ),
        Err(e) => {
            warn!(target: "dashboard", error = %e, "Worker directory unavailable");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WorkersResponse {
                    success: false,
                    data: Vec::new(),
                    count: 0,
                    timestamp: Utc::now(),
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerHealthEntry {
    name: String,
    status: HealthStatus,
    error_rate: f64,
    requests: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    total_workers: usize,
    healthy: usize,
    warning: usize,
    error: usize,
    total_requests: u64,
    total_errors: u64,
    avg_error_rate: f64,
    workers: Vec<WorkerHealthEntry>,
    timestamp: DateTime<Utc>,
}

/// Fleet health rollup for the overview page
async fn workers_health_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let workers = match fetch_workers_with_metrics(&state).await {
        Ok(workers) => workers,
        Err(e) => {
            warn!(target: "dashboard", error = %e, "Health rollup degraded to empty fleet");
            Vec::new()
        }
    };

    let avg_error_rate = if workers.is_empty() {
        0.0
    } else {
        workers.iter().map(|w| w.error_rate).sum::<f64>() / workers.len() as f64
    };

    Json(HealthResponse {
        total_workers: workers.len(),
        healthy: workers.iter().filter(|w| w.status == HealthStatus::Healthy).count(),
        warning: workers.iter().filter(|w| w.status == HealthStatus::Warning).count(),
        error: workers.iter().filter(|w| w.status == HealthStatus::Error).count(),
        total_requests: workers.iter().map(|w| w.requests).sum(),
        total_errors: workers.iter().map(|w| w.errors).sum(),
        avg_error_rate,
        workers: workers
            .into_iter()
            .map(|w| WorkerHealthEntry {
                name: w.name,
                status: w.status,
                error_rate: w.error_rate,
                requests: w.requests,
            })
            .collect(),
        timestamp: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Aggregate snapshot
// ---------------------------------------------------------------------------

/// Coalesced dashboard snapshot; always succeeds, failed sources are zeroed
async fn aggregate_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let snapshot = state.aggregator.snapshot().await;
    Json(serde_json::json!({
        "success": true,
        "data": snapshot,
        "timestamp": Utc::now(),
    }))
}
