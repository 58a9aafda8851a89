// Telemetry backend client
//
// Authenticated transport to the remote analytics API: GraphQL for
// invocation events and aggregate metrics, REST for the worker directory
// and account audit log. No caching and no retries here; degradation is a
// query-engine concern.

use crate::config::{Credentials, TelemetryConfig};
use crate::logs::{LogFilter, RawInvocation};
use crate::{Result, WatchError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Deployed worker as listed by the resource API
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDescriptor {
    pub id: String,
    pub name: String,
    pub created_on: Option<DateTime<Utc>>,
    pub modified_on: Option<DateTime<Utc>>,
}

/// Pre-aggregated per-worker telemetry over a time window.
/// Derived per query, never mutated in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTelemetrySummary {
    pub script_name: String,
    pub invocations: u64,
    pub errors: u64,
    pub p50_cpu_ms: f64,
    pub p99_cpu_ms: f64,
    pub p50_duration_ms: f64,
    pub p99_duration_ms: f64,
}

/// One account audit log record
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub actor_email: String,
    pub resource_type: String,
    pub resource_id: String,
}

/// Read operations against the remote telemetry backend.
///
/// The query engine and the aggregation facade talk to this trait so tests
/// can swap in stub backends without any network.
#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    /// List deployed workers, independent of whether they have telemetry
    async fn list_workers(&self) -> Result<Vec<WorkerDescriptor>>;

    /// Per-invocation events inside the filter window, newest first
    async fn query_invocations(&self, filter: &LogFilter) -> Result<Vec<RawInvocation>>;

    /// Pre-aggregated per-worker rows over the window
    async fn query_aggregate_metrics(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WorkerTelemetrySummary>>;

    /// Most recent account audit events
    async fn list_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>>;
}

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "A: Deserialize<'de>"))]
struct GraphqlEnvelope<A> {
    #[serde(default)]
    data: Option<GraphqlViewer<A>>,
    // The backend emits `"errors": null` on success
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlViewer<A> {
    viewer: GraphqlAccounts<A>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "A: Deserialize<'de>"))]
struct GraphqlAccounts<A> {
    #[serde(default)]
    accounts: Vec<A>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvocationsAccount {
    #[serde(default)]
    workers_invocations_adaptive: Vec<RawInvocation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupsAccount {
    #[serde(default)]
    workers_invocations_adaptive_groups: Vec<AggregateGroup>,
}

#[derive(Debug, Deserialize)]
struct AggregateGroup {
    dimensions: GroupDimensions,
    sum: GroupSum,
    quantiles: GroupQuantiles,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupDimensions {
    script_name: String,
}

#[derive(Debug, Deserialize)]
struct GroupSum {
    #[serde(default)]
    requests: u64,
    #[serde(default)]
    errors: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GroupQuantiles {
    #[serde(default)]
    cpu_time_p50: f64,
    #[serde(default)]
    cpu_time_p99: f64,
    #[serde(default)]
    duration_p50: f64,
    #[serde(default)]
    duration_p99: f64,
}

#[derive(Debug, Deserialize)]
struct RestEnvelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<RestError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RestError {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RestScript {
    id: String,
    #[serde(default)]
    created_on: Option<DateTime<Utc>>,
    #[serde(default)]
    modified_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RestAuditRow {
    id: String,
    when: DateTime<Utc>,
    action: RestAuditAction,
    actor: RestAuditActor,
    resource: RestAuditResource,
}

#[derive(Debug, Deserialize)]
struct RestAuditAction {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RestAuditActor {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Deserialize)]
struct RestAuditResource {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    id: String,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

const INVOCATIONS_QUERY: &str = r#"
query GetWorkerEvents($accountTag: string!, $filter: AccountWorkersInvocationsAdaptiveFilter_InputObject!, $limit: Int!) {
  viewer {
    accounts(filter: { accountTag: $accountTag }) {
      workersInvocationsAdaptive(
        filter: $filter
        limit: $limit
        orderBy: [datetime_DESC]
      ) {
        datetime
        scriptName
        outcome
        responseStatus
        cpuTimeMs
        wallTimeMs
        logs {
          level
          message
        }
        exceptions {
          name
          message
          timestamp
        }
      }
    }
  }
}
"#;

const AGGREGATE_QUERY: &str = r#"
query GetWorkersTelemetry($accountTag: string!, $filter: AccountWorkersInvocationsAdaptiveGroupsFilter_InputObject!) {
  viewer {
    accounts(filter: { accountTag: $accountTag }) {
      workersInvocationsAdaptiveGroups(
        filter: $filter
        limit: 100
        orderBy: [sum_requests_DESC]
      ) {
        dimensions {
          scriptName
        }
        sum {
          requests
          errors
        }
        quantiles {
          cpuTimeP50
          cpuTimeP99
          durationP50
          durationP99
        }
      }
    }
  }
}
"#;

/// HTTP client for the telemetry backend
pub struct TelemetryClient {
    credentials: Credentials,
    config: TelemetryConfig,
    http: reqwest::Client,
    timeout: Duration,
}

impl TelemetryClient {
    pub fn new(credentials: Credentials, config: TelemetryConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            credentials,
            config,
            http,
            timeout,
        }
    }

    /// POST a GraphQL query and decode the account payload.
    ///
    /// A transport/HTTP failure maps to `UpstreamUnavailable`; a structured
    /// `errors` list maps to `UpstreamRejected` since it usually signals a
    /// schema or permission problem that a blind retry will not fix.
    async fn graphql<A>(&self, query: &str, variables: serde_json::Value) -> Result<Vec<A>>
    where
        A: serde::de::DeserializeOwned,
    {
        let response = self
            .http
            .post(&self.config.graphql_endpoint)
            .bearer_auth(&self.credentials.api_token)
            // The builder fallback client has no timeout; keep the bound here.
            .timeout(self.timeout)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| WatchError::UpstreamUnavailable(format!("graphql request: {}", e)))?;

        if !response.status().is_success() {
            return Err(WatchError::UpstreamUnavailable(format!(
                "graphql status: {}",
                response.status()
            )));
        }

        let envelope: GraphqlEnvelope<A> = response
            .json()
            .await
            .map_err(|e| WatchError::UpstreamUnavailable(format!("graphql decode: {}", e)))?;

        if let Some(errors) = envelope.errors.filter(|e| !e.is_empty()) {
            let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
            return Err(WatchError::UpstreamRejected(messages.join("; ")));
        }

        Ok(envelope
            .data
            .map(|d| d.viewer.accounts)
            .unwrap_or_default())
    }

    /// GET a REST resource and unwrap the `{success, errors, result}` envelope
    async fn rest<T>(&self, path: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.config.api_base, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.credentials.api_token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| WatchError::UpstreamUnavailable(format!("rest request: {}", e)))?;

        if !response.status().is_success() {
            return Err(WatchError::UpstreamUnavailable(format!(
                "rest status {} for {}",
                response.status(),
                path
            )));
        }

        let envelope: RestEnvelope<T> = response
            .json()
            .await
            .map_err(|e| WatchError::UpstreamUnavailable(format!("rest decode: {}", e)))?;

        if !envelope.success {
            let messages: Vec<String> = envelope
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect();
            return Err(WatchError::UpstreamRejected(messages.join("; ")));
        }

        envelope.result.ok_or_else(|| {
            WatchError::UpstreamUnavailable(format!("rest result missing for {}", path))
        })
    }

    fn invocation_filter(filter: &LogFilter) -> serde_json::Value {
        let mut f = json!({
            "datetime_geq": filter.since.to_rfc3339(),
            "datetime_leq": filter.until.to_rfc3339(),
        });
        if let Some(script) = &filter.script_name {
            f["scriptName"] = json!(script);
        }
        if let Some(outcome) = &filter.outcome {
            f["outcome"] = json!(outcome);
        }
        f
    }
}

#[async_trait]
impl TelemetryBackend for TelemetryClient {
    async fn list_workers(&self) -> Result<Vec<WorkerDescriptor>> {
        let path = format!("/accounts/{}/workers/scripts", self.credentials.account_id);
        let scripts: Vec<RestScript> = self.rest(&path).await?;
        debug!(target: "telemetry", count = scripts.len(), "Listed workers");

        Ok(scripts
            .into_iter()
            .map(|s| WorkerDescriptor {
                name: s.id.clone(),
                id: s.id,
                created_on: s.created_on,
                modified_on: s.modified_on,
            })
            .collect())
    }

    async fn query_invocations(&self, filter: &LogFilter) -> Result<Vec<RawInvocation>> {
        let variables = json!({
            "accountTag": self.credentials.account_id,
            "filter": Self::invocation_filter(filter),
            "limit": filter.limit,
        });

        let accounts: Vec<InvocationsAccount> =
            self.graphql(INVOCATIONS_QUERY, variables).await?;
        let invocations = accounts
            .into_iter()
            .next()
            .map(|a| a.workers_invocations_adaptive)
            .unwrap_or_default();

        debug!(
            target: "telemetry",
            count = invocations.len(),
            script = filter.script_name.as_deref().unwrap_or("all"),
            "Fetched invocation events"
        );
        Ok(invocations)
    }

    async fn query_aggregate_metrics(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WorkerTelemetrySummary>> {
        let variables = json!({
            "accountTag": self.credentials.account_id,
            "filter": {
                "datetime_geq": since.to_rfc3339(),
                "datetime_leq": until.to_rfc3339(),
            },
        });

        let accounts: Vec<GroupsAccount> = self.graphql(AGGREGATE_QUERY, variables).await?;
        let groups = accounts
            .into_iter()
            .next()
            .map(|a| a.workers_invocations_adaptive_groups)
            .unwrap_or_default();

        Ok(groups
            .into_iter()
            .map(|g| WorkerTelemetrySummary {
                script_name: g.dimensions.script_name,
                invocations: g.sum.requests,
                errors: g.sum.errors,
                p50_cpu_ms: g.quantiles.cpu_time_p50,
                p99_cpu_ms: g.quantiles.cpu_time_p99,
                p50_duration_ms: g.quantiles.duration_p50,
                p99_duration_ms: g.quantiles.duration_p99,
            })
            .collect())
    }

    async fn list_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let path = format!(
            "/accounts/{}/audit_logs?per_page={}",
            self.credentials.account_id, limit
        );
        let rows: Vec<RestAuditRow> = self.rest(&path).await.map_err(|e| {
            warn!(target: "telemetry", error = %e, "Audit log fetch failed");
            e
        })?;

        Ok(rows
            .into_iter()
            .map(|r| AuditEvent {
                id: r.id,
                timestamp: r.when,
                action: r.action.kind,
                actor_email: r.actor.email,
                resource_type: r.resource.kind,
                resource_id: r.resource.id,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn invocation_filter_includes_optional_fields() {
        let since = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        let mut filter = LogFilter::window(since, until);
        filter.script_name = Some("api-router".to_string());
        filter.outcome = Some("exception".to_string());

        let value = TelemetryClient::invocation_filter(&filter);
        assert_eq!(value["scriptName"], "api-router");
        assert_eq!(value["outcome"], "exception");
        assert!(value["datetime_geq"].as_str().unwrap().starts_with("2024-05-01T00:00:00"));
    }

    #[test]
    fn invocation_filter_omits_absent_fields() {
        let since = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        let value = TelemetryClient::invocation_filter(&LogFilter::window(since, until));
        assert!(value.get("scriptName").is_none());
        assert!(value.get("outcome").is_none());
    }

    #[test]
    fn graphql_envelope_decodes_invocations() {
        let body = serde_json::json!({
            "data": { "viewer": { "accounts": [ {
                "workersInvocationsAdaptive": [ {
                    "datetime": "2024-05-01T12:00:00Z",
                    "scriptName": "api-router",
                    "outcome": "ok",
                    "responseStatus": 200,
                    "wallTimeMs": 42.0,
                    "logs": [],
                    "exceptions": []
                } ]
            } ] } },
            "errors": null
        });
        let envelope: GraphqlEnvelope<InvocationsAccount> =
            serde_json::from_value(body).unwrap();
        let account = envelope.data.unwrap().viewer.accounts.into_iter().next().unwrap();
        assert_eq!(account.workers_invocations_adaptive.len(), 1);
        assert_eq!(account.workers_invocations_adaptive[0].script_name, "api-router");
    }
}
