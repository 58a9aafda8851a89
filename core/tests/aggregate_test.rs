//! Aggregation Facade Tests
//!
//! - each source settles to its zero default independently
//! - a total failure still produces a successful snapshot
//! - the short-TTL cache bounds backend call volume and can be cleared

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flarewatch_core::client::WorkerTelemetrySummary;
use flarewatch_core::logs::{LogFilter, RawInvocation};
use flarewatch_core::{
    Aggregator, AuditEvent, Result, TelemetryBackend, WatchError, WorkerDescriptor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct FlakyBackend {
    fail_metrics: bool,
    fail_workers: bool,
    fail_audit: bool,
    metrics_calls: AtomicUsize,
}

impl FlakyBackend {
    fn healthy() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetryBackend for FlakyBackend {
    async fn list_workers(&self) -> Result<Vec<WorkerDescriptor>> {
        if self.fail_workers {
            return Err(WatchError::UpstreamUnavailable("scripts down".to_string()));
        }
        Ok(vec![
            WorkerDescriptor {
                id: "api-router".to_string(),
                name: "api-router".to_string(),
                created_on: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                modified_on: Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()),
            },
            WorkerDescriptor {
                id: "cron-sync".to_string(),
                name: "cron-sync".to_string(),
                created_on: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
                modified_on: None,
            },
        ])
    }

    async fn query_invocations(&self, _filter: &LogFilter) -> Result<Vec<RawInvocation>> {
        Ok(Vec::new())
    }

    async fn query_aggregate_metrics(
        &self,
        _since: DateTime<Utc>,
        _until: DateTime<Utc>,
    ) -> Result<Vec<WorkerTelemetrySummary>> {
        self.metrics_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_metrics {
            return Err(WatchError::UpstreamRejected("no permission".to_string()));
        }
        Ok(vec![
            WorkerTelemetrySummary {
                script_name: "api-router".to_string(),
                invocations: 100,
                errors: 4,
                p50_cpu_ms: 2.0,
                p99_cpu_ms: 9.0,
                p50_duration_ms: 12.0,
                p99_duration_ms: 80.0,
            },
            WorkerTelemetrySummary {
                script_name: "cron-sync".to_string(),
                invocations: 50,
                errors: 0,
                p50_cpu_ms: 4.0,
                p99_cpu_ms: 11.0,
                p50_duration_ms: 20.0,
                p99_duration_ms: 90.0,
            },
        ])
    }

    async fn list_audit_events(&self, _limit: usize) -> Result<Vec<AuditEvent>> {
        if self.fail_audit {
            return Err(WatchError::UpstreamUnavailable("audit down".to_string()));
        }
        Ok(vec![
            AuditEvent {
                id: "evt-1".to_string(),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
                action: "script.update".to_string(),
                actor_email: "dev@example.com".to_string(),
                resource_type: "script".to_string(),
                resource_id: "api-router".to_string(),
            },
            AuditEvent {
                id: "evt-2".to_string(),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
                action: "script.update".to_string(),
                actor_email: "ops@example.com".to_string(),
                resource_type: "script".to_string(),
                resource_id: "cron-sync".to_string(),
            },
        ])
    }
}

#[tokio::test]
async fn snapshot_combines_all_sources() {
    let aggregator = Aggregator::new(Arc::new(FlakyBackend::healthy()));
    let snapshot = aggregator.snapshot().await;

    assert_eq!(snapshot.workers.total_requests, 150);
    assert_eq!(snapshot.workers.total_errors, 4);
    assert_eq!(snapshot.workers.active_workers, 2);
    assert!((snapshot.workers.avg_cpu_ms - 3.0).abs() < f64::EPSILON);

    assert_eq!(snapshot.builds.total, 2);
    assert_eq!(snapshot.builds.successful, 1);
    assert_eq!(snapshot.builds.failed, 1);
    assert!(snapshot.builds.last_deployed_at.is_some());

    assert_eq!(snapshot.audit.total, 2);
    assert_eq!(snapshot.audit.by_action.get("script.update"), Some(&2));
    assert_eq!(snapshot.audit.by_actor.len(), 2);
}

#[tokio::test]
async fn one_failed_source_settles_to_default_only() {
    let backend = FlakyBackend {
        fail_metrics: true,
        ..FlakyBackend::healthy()
    };
    let aggregator = Aggregator::new(Arc::new(backend));
    let snapshot = aggregator.snapshot().await;

    // Failed source at its documented zero default
    assert_eq!(snapshot.workers.total_requests, 0);
    assert_eq!(snapshot.workers.active_workers, 0);
    // The other two still populated
    assert_eq!(snapshot.builds.total, 2);
    assert_eq!(snapshot.audit.total, 2);
}

#[tokio::test]
async fn total_failure_still_yields_a_snapshot() {
    let backend = FlakyBackend {
        fail_metrics: true,
        fail_workers: true,
        fail_audit: true,
        ..FlakyBackend::healthy()
    };
    let aggregator = Aggregator::new(Arc::new(backend));
    let snapshot = aggregator.snapshot().await;

    assert_eq!(snapshot.workers.active_workers, 0);
    assert_eq!(snapshot.builds.total, 0);
    assert_eq!(snapshot.audit.total, 0);
}

#[tokio::test]
async fn snapshot_is_cached_within_ttl() {
    let backend = Arc::new(FlakyBackend::healthy());
    let aggregator = Aggregator::with_ttl(
        Arc::clone(&backend) as Arc<dyn TelemetryBackend>,
        Duration::from_secs(60),
    );

    aggregator.snapshot().await;
    aggregator.snapshot().await;
    aggregator.snapshot().await;

    assert_eq!(backend.metrics_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_entries_are_refreshed() {
    let backend = Arc::new(FlakyBackend::healthy());
    let aggregator = Aggregator::with_ttl(
        Arc::clone(&backend) as Arc<dyn TelemetryBackend>,
        Duration::from_millis(20),
    );

    aggregator.snapshot().await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    aggregator.snapshot().await;

    assert_eq!(backend.metrics_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn clear_cache_forces_a_refetch() {
    let backend = Arc::new(FlakyBackend::healthy());
    let aggregator = Aggregator::with_ttl(
        Arc::clone(&backend) as Arc<dyn TelemetryBackend>,
        Duration::from_secs(60),
    );

    aggregator.snapshot().await;
    aggregator.clear_cache();
    aggregator.snapshot().await;

    assert_eq!(backend.metrics_calls.load(Ordering::SeqCst), 2);
}
