// Log query engine
//
// Translates a filter into backend calls and returns one filtered, ordered,
// capped batch of normalized entries. Logs are best-effort observability
// data: upstream failures degrade to a coarser query or an empty batch, they
// never surface to the caller.

use crate::client::{TelemetryBackend, WorkerTelemetrySummary};
use crate::logs::{normalize, EventType, LogEntry, LogFilter, LogLevel};
use crate::{Result, WatchError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Query engine over a telemetry backend
pub struct QueryEngine {
    backend: Arc<dyn TelemetryBackend>,
}

impl QueryEngine {
    pub fn new(backend: Arc<dyn TelemetryBackend>) -> Self {
        Self { backend }
    }

    /// Run one log query.
    ///
    /// `Err` is returned only for an invalid filter; any backend failure
    /// degrades. If the rich invocation query is rejected (schema or
    /// permission class), the coarse aggregate query substitutes one summary
    /// entry per worker. If that also fails the result is simply empty.
    pub async fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        filter.validate()?;

        let mut entries = match self.backend.query_invocations(filter).await {
            Ok(invocations) => {
                let mut out = Vec::new();
                for inv in &invocations {
                    match normalize(inv) {
                        Ok(batch) => out.extend(batch),
                        Err(e) => {
                            // One bad record never aborts the batch.
                            warn!(target: "query", error = %e, "Skipping malformed record");
                        }
                    }
                }
                out
            }
            Err(e @ WatchError::UpstreamRejected(_)) => {
                warn!(target: "query", error = %e, "Invocation query rejected, degrading to aggregate metrics");
                self.coarse_fallback(filter).await
            }
            Err(e) => {
                warn!(target: "query", error = %e, "Invocation query unavailable, trying aggregate fallback once");
                self.coarse_fallback(filter).await
            }
        };

        // Post-processing, in order: level, search, window clamp, sort, cap.
        if let Some(level) = filter.level {
            entries.retain(|e| e.level == level);
        }
        if let Some(search) = &filter.search {
            let needle = search.to_lowercase();
            entries.retain(|e| {
                e.joined_message().to_lowercase().contains(&needle)
                    || e.script_name.to_lowercase().contains(&needle)
            });
        }
        entries.retain(|e| filter.contains(e.timestamp));
        // Stable sort keeps backend order for equal timestamps.
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(filter.limit);

        debug!(
            target: "query",
            count = entries.len(),
            script = filter.script_name.as_deref().unwrap_or("all"),
            "Query complete"
        );
        Ok(entries)
    }

    /// Degraded path: synthesize coarse invocation-summary entries from
    /// aggregate rows. No console or exception detail survives here.
    async fn coarse_fallback(&self, filter: &LogFilter) -> Vec<LogEntry> {
        match self
            .backend
            .query_aggregate_metrics(filter.since, filter.until)
            .await
        {
            Ok(rows) => rows
                .iter()
                .filter(|row| match &filter.script_name {
                    Some(script) => &row.script_name == script,
                    None => true,
                })
                .map(|row| coarse_entry(row, filter))
                .collect(),
            Err(e) => {
                warn!(target: "query", error = %e, "Aggregate fallback failed, returning empty batch");
                Vec::new()
            }
        }
    }
}

fn coarse_entry(row: &WorkerTelemetrySummary, filter: &LogFilter) -> LogEntry {
    let level = if row.errors > 0 {
        LogLevel::Error
    } else {
        LogLevel::Info
    };
    LogEntry {
        // Aggregate rows carry no timestamp of their own; pin them to the
        // window's upper bound so they stay inside it.
        timestamp: filter.until,
        level,
        message: vec![format!(
            "{} requests, {} errors over window",
            row.invocations, row.errors
        )],
        script_name: row.script_name.clone(),
        outcome: if row.errors > 0 { "errors" } else { "ok" }.to_string(),
        event_type: EventType::Invocation,
        ray_id: None,
        exceptions: None,
    }
}
