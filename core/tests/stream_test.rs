//! Streaming Session Tests
//!
//! Drives the poll-and-forward loop against a scripted backend:
//! - entries are delivered at most once across consecutive poll windows
//! - delivery order is oldest-first per batch
//! - dropping the subscriber tears the session down

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flarewatch_core::client::WorkerTelemetrySummary;
use flarewatch_core::logs::{LogFilter, RawInvocation};
use flarewatch_core::{
    AuditEvent, LogStreamManager, QueryEngine, Result, StreamConfig, TelemetryBackend,
    WorkerDescriptor,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;

/// Backend holding a mutable set of invocations; a query returns those whose
/// timestamp falls inside the requested window, like the real backend does.
#[derive(Default)]
struct WindowedBackend {
    invocations: Mutex<Vec<RawInvocation>>,
}

impl WindowedBackend {
    fn push(&self, script: &str, at: DateTime<Utc>) {
        self.invocations.lock().unwrap().push(RawInvocation {
            script_name: script.to_string(),
            datetime: at,
            outcome: "ok".to_string(),
            response_status: Some(200),
            cpu_time_ms: 1.0,
            wall_time_ms: 5.0,
            logs: Vec::new(),
            exceptions: Vec::new(),
            ray_id: None,
        });
    }
}

#[async_trait]
impl TelemetryBackend for WindowedBackend {
    async fn list_workers(&self) -> Result<Vec<WorkerDescriptor>> {
        Ok(Vec::new())
    }

    async fn query_invocations(&self, filter: &LogFilter) -> Result<Vec<RawInvocation>> {
        Ok(self
            .invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|inv| inv.datetime >= filter.since && inv.datetime <= filter.until)
            .filter(|inv| match &filter.script_name {
                Some(script) => &inv.script_name == script,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn query_aggregate_metrics(
        &self,
        _since: DateTime<Utc>,
        _until: DateTime<Utc>,
    ) -> Result<Vec<WorkerTelemetrySummary>> {
        Ok(Vec::new())
    }

    async fn list_audit_events(&self, _limit: usize) -> Result<Vec<AuditEvent>> {
        Ok(Vec::new())
    }
}

fn manager(backend: Arc<WindowedBackend>, poll_ms: u64) -> LogStreamManager {
    let engine = Arc::new(QueryEngine::new(backend));
    LogStreamManager::new(
        engine,
        StreamConfig {
            poll_interval_ms: poll_ms,
            poll_limit: 100,
        },
    )
}

#[tokio::test]
async fn entries_are_delivered_once_in_order() {
    let backend = Arc::new(WindowedBackend::default());
    let manager = manager(Arc::clone(&backend), 40);

    let mut stream = manager.open(Some("api-router".to_string()));

    // Arrives during the first poll window
    backend.push("api-router", Utc::now());
    let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("first entry within two polls")
        .expect("stream open");
    assert_eq!(first.script_name, "api-router");

    // Nothing new: the high-water mark must suppress the old entry even
    // though the backend still holds it
    let quiet = tokio::time::timeout(Duration::from_millis(150), stream.next()).await;
    assert!(quiet.is_err(), "old entry was re-delivered");

    // A later arrival comes through exactly once
    backend.push("api-router", Utc::now());
    let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("second entry within two polls")
        .expect("stream open");
    assert!(second.timestamp >= first.timestamp);

    let quiet = tokio::time::timeout(Duration::from_millis(150), stream.next()).await;
    assert!(quiet.is_err(), "entry delivered twice");
}

#[tokio::test]
async fn batch_is_forwarded_oldest_first() {
    let backend = Arc::new(WindowedBackend::default());
    let manager = manager(Arc::clone(&backend), 60);

    let mut stream = manager.open(None);

    let now = Utc::now();
    backend.push("a", now);
    backend.push("b", now + chrono::Duration::milliseconds(10));

    let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("batch within two polls")
        .expect("stream open");
    let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("batch within two polls")
        .expect("stream open");

    // Live tail appends chronologically
    assert!(first.timestamp <= second.timestamp);
    assert_eq!(first.script_name, "a");
    assert_eq!(second.script_name, "b");
}

#[tokio::test]
async fn script_filter_reaches_the_backend() {
    let backend = Arc::new(WindowedBackend::default());
    let manager = manager(Arc::clone(&backend), 40);

    let mut stream = manager.open(Some("api-router".to_string()));

    backend.push("other-worker", Utc::now());
    let quiet = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
    assert!(quiet.is_err(), "entry from unrelated worker leaked through");
}

#[tokio::test]
async fn dropping_the_subscriber_closes_the_session() {
    let backend = Arc::new(WindowedBackend::default());
    let manager = manager(Arc::clone(&backend), 30);

    let stream = manager.open(None);
    assert_eq!(manager.active_sessions(), 1);

    drop(stream);
    // The loop notices the closed channel between polls
    tokio::time::timeout(Duration::from_secs(2), async {
        while manager.active_sessions() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session should be released after disconnect");
}

#[tokio::test]
async fn multiple_sessions_are_independent() {
    let backend = Arc::new(WindowedBackend::default());
    let manager = manager(Arc::clone(&backend), 40);

    let mut a = manager.open(None);
    let b = manager.open(None);
    assert_eq!(manager.active_sessions(), 2);

    drop(b);
    backend.push("api-router", Utc::now());

    // Session a still delivers after b went away
    let entry = tokio::time::timeout(Duration::from_secs(2), a.next())
        .await
        .expect("entry within two polls")
        .expect("stream open");
    assert_eq!(entry.script_name, "api-router");
}
