// Aggregation facade
//
// Composes independent read sources (fleet metrics, deploy history, audit
// activity) into one dashboard snapshot. Sources are queried concurrently
// and each failure is settled to that source's zero default, so the snapshot
// itself never fails. A short-TTL cache bounds backend call volume under
// rapid UI polling.

use crate::client::{AuditEvent, TelemetryBackend};
use crate::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_TTL_SECS: u64 = 30;
const METRICS_WINDOW_HOURS: i64 = 24;
const AUDIT_FETCH_LIMIT: usize = 100;
const AUDIT_RECENT_COUNT: usize = 10;

/// Account-wide worker telemetry rollup
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetMetrics {
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_cpu_ms: f64,
    pub active_workers: usize,
}

/// Deploy history rollup, derived from worker directory metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub last_deployed_at: Option<DateTime<Utc>>,
}

/// Account audit activity rollup
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub total: usize,
    pub by_action: HashMap<String, u64>,
    pub by_actor: HashMap<String, u64>,
    pub recent: Vec<AuditEvent>,
}

/// Coalesced dashboard snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub workers: FleetMetrics,
    pub builds: BuildStats,
    pub audit: AuditSummary,
}

/// Substitute the documented default when an independent source fails
fn settle<T: Default>(source: &str, result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(target: "aggregate", source = source, error = %e, "Source failed, using default");
            T::default()
        }
    }
}

struct CachedSnapshot {
    inserted: Instant,
    snapshot: AggregateSnapshot,
}

/// Best-effort fan-out aggregator over the telemetry backend.
///
/// Constructed once at process start and injected into route state; the
/// cache is the only cross-request shared mutable state and is append and
/// expire only.
pub struct Aggregator {
    backend: Arc<dyn TelemetryBackend>,
    cache: DashMap<String, CachedSnapshot>,
    ttl: Duration,
}

impl Aggregator {
    pub fn new(backend: Arc<dyn TelemetryBackend>) -> Self {
        Self::with_ttl(backend, Duration::from_secs(DEFAULT_TTL_SECS))
    }

    pub fn with_ttl(backend: Arc<dyn TelemetryBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Build the coalesced snapshot.
    ///
    /// Always succeeds: a failed source contributes its zero default instead
    /// of aborting the aggregation.
    pub async fn snapshot(&self) -> AggregateSnapshot {
        if let Some(cached) = self.cache.get("snapshot") {
            if cached.inserted.elapsed() < self.ttl {
                debug!(target: "aggregate", "Serving cached snapshot");
                return cached.snapshot.clone();
            }
        }

        let (workers, builds, audit) = tokio::join!(
            self.fleet_metrics(),
            self.build_stats(),
            self.audit_summary(),
        );

        let snapshot = AggregateSnapshot {
            timestamp: Utc::now(),
            workers: settle("workers", workers),
            builds: settle("builds", builds),
            audit: settle("audit", audit),
        };

        self.cache.insert(
            "snapshot".to_string(),
            CachedSnapshot {
                inserted: Instant::now(),
                snapshot: snapshot.clone(),
            },
        );
        snapshot
    }

    /// Drop all cached entries; the next snapshot hits the backend again
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    async fn fleet_metrics(&self) -> Result<FleetMetrics> {
        let until = Utc::now();
        let since = until - ChronoDuration::hours(METRICS_WINDOW_HOURS);
        let rows = self.backend.query_aggregate_metrics(since, until).await?;

        let total_requests = rows.iter().map(|r| r.invocations).sum();
        let total_errors = rows.iter().map(|r| r.errors).sum();
        let avg_cpu_ms = if rows.is_empty() {
            0.0
        } else {
            rows.iter().map(|r| r.p50_cpu_ms).sum::<f64>() / rows.len() as f64
        };

        Ok(FleetMetrics {
            total_requests,
            total_errors,
            avg_cpu_ms,
            active_workers: rows.len(),
        })
    }

    /// The deploy API exposes no build log, so history is reconstructed from
    /// the directory's modification metadata: a worker with a modified_on
    /// stamp counts as one successful deploy.
    async fn build_stats(&self) -> Result<BuildStats> {
        let workers = self.backend.list_workers().await?;

        let total = workers.len();
        let successful = workers.iter().filter(|w| w.modified_on.is_some()).count();
        let last_deployed_at = workers.iter().filter_map(|w| w.modified_on).max();

        Ok(BuildStats {
            total,
            successful,
            failed: total - successful,
            success_rate: if total > 0 {
                successful as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            last_deployed_at,
        })
    }

    async fn audit_summary(&self) -> Result<AuditSummary> {
        let events = self.backend.list_audit_events(AUDIT_FETCH_LIMIT).await?;

        let mut by_action: HashMap<String, u64> = HashMap::new();
        let mut by_actor: HashMap<String, u64> = HashMap::new();
        for event in &events {
            *by_action.entry(event.action.clone()).or_insert(0) += 1;
            *by_actor.entry(event.actor_email.clone()).or_insert(0) += 1;
        }

        Ok(AuditSummary {
            total: events.len(),
            by_action,
            by_actor,
            recent: events.into_iter().take(AUDIT_RECENT_COUNT).collect(),
        })
    }
}
