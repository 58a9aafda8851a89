// Canonical log model and normalizer
//
// The telemetry backend returns heterogeneous event shapes (invocation
// summaries, console lines, exceptions). Everything is normalized into one
// LogEntry type with a closed level/event-type vocabulary before any
// filtering or delivery happens.

use crate::{Result, WatchError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log severity, closed set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Log,
}

impl LogLevel {
    /// Case-insensitive parse. Unrecognized levels fall back to `Log` so a
    /// worker emitting a custom level still shows up in the stream.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            _ => Self::Log,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Log => "log",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a normalized entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Synthesized invocation summary
    Invocation,
    /// Console log line captured during the invocation
    Console,
    /// Decoded uncaught exception
    Exception,
}

/// Exception attached to an invocation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerException {
    pub name: String,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One normalized log entry, the unit of every query result and stream frame
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Primary ordering key, newest first
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// A log call may emit multiple arguments; order preserved
    pub message: Vec<String>,
    /// Worker script that produced the entry
    pub script_name: String,
    /// Terminal state of the invocation ("ok", a failure code, ...)
    pub outcome: String,
    pub event_type: EventType,
    /// Backend-assigned request identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ray_id: Option<String>,
    /// Present only on the invocation-summary entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exceptions: Option<Vec<WorkerException>>,
}

impl LogEntry {
    /// Message arguments joined for display and search
    pub fn joined_message(&self) -> String {
        self.message.join(" ")
    }
}

// ---------------------------------------------------------------------------
// Raw input boundary
// ---------------------------------------------------------------------------

/// Console record nested in a raw invocation
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawConsoleLog {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: Vec<String>,
}

/// Exception record nested in a raw invocation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawException {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One invocation row as returned by the analytics backend
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInvocation {
    #[serde(default)]
    pub script_name: String,
    pub datetime: DateTime<Utc>,
    pub outcome: String,
    #[serde(default)]
    pub response_status: Option<u16>,
    #[serde(default)]
    pub cpu_time_ms: f64,
    #[serde(default)]
    pub wall_time_ms: f64,
    #[serde(default)]
    pub logs: Vec<RawConsoleLog>,
    #[serde(default)]
    pub exceptions: Vec<RawException>,
    #[serde(default)]
    pub ray_id: Option<String>,
}

/// Transform one raw invocation into its normalized entries.
///
/// Always yields the invocation summary first, then one entry per console
/// line, then one per exception. An invocation with no nested records yields
/// exactly one entry.
pub fn normalize(inv: &RawInvocation) -> Result<Vec<LogEntry>> {
    if inv.script_name.trim().is_empty() {
        // Never substitute a placeholder that could pass for a real worker.
        return Err(WatchError::MalformedRecord(
            "invocation record has no scriptName".to_string(),
        ));
    }

    let mut entries = Vec::with_capacity(1 + inv.logs.len() + inv.exceptions.len());

    let summary_level = if inv.outcome == "ok" {
        LogLevel::Info
    } else {
        LogLevel::Error
    };
    let summary_message = match inv.response_status {
        Some(status) => format!(
            "{} {} - {}ms",
            inv.outcome.to_uppercase(),
            status,
            inv.wall_time_ms
        ),
        None => format!("{} - {}ms", inv.outcome.to_uppercase(), inv.wall_time_ms),
    };
    entries.push(LogEntry {
        timestamp: inv.datetime,
        level: summary_level,
        message: vec![summary_message],
        script_name: inv.script_name.clone(),
        outcome: inv.outcome.clone(),
        event_type: EventType::Invocation,
        ray_id: inv.ray_id.clone(),
        exceptions: if inv.exceptions.is_empty() {
            None
        } else {
            Some(
                inv.exceptions
                    .iter()
                    .map(|e| WorkerException {
                        name: e.name.clone(),
                        message: e.message.clone(),
                        timestamp: e.timestamp,
                    })
                    .collect(),
            )
        },
    });

    for log in &inv.logs {
        entries.push(LogEntry {
            timestamp: inv.datetime,
            level: LogLevel::parse(&log.level),
            message: log.message.clone(),
            script_name: inv.script_name.clone(),
            outcome: inv.outcome.clone(),
            event_type: EventType::Console,
            ray_id: inv.ray_id.clone(),
            exceptions: None,
        });
    }

    for exc in &inv.exceptions {
        entries.push(LogEntry {
            // An exception may carry its own, more precise timestamp.
            timestamp: exc.timestamp.unwrap_or(inv.datetime),
            level: LogLevel::Error,
            message: vec![format!("{}: {}", exc.name, exc.message)],
            script_name: inv.script_name.clone(),
            outcome: inv.outcome.clone(),
            event_type: EventType::Exception,
            ray_id: inv.ray_id.clone(),
            exceptions: None,
        });
    }

    Ok(entries)
}

// ---------------------------------------------------------------------------
// Filter specification
// ---------------------------------------------------------------------------

/// Query input for the engine. Time bounds are always explicit here; the
/// HTTP layer substitutes the default window before building a filter.
#[derive(Clone, Debug)]
pub struct LogFilter {
    /// Worker filter; `None` means all workers
    pub script_name: Option<String>,
    pub level: Option<LogLevel>,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub limit: usize,
    /// Case-insensitive substring filter over message and script name
    pub search: Option<String>,
    /// Exact-match outcome filter, pushed down to the backend
    pub outcome: Option<String>,
}

impl LogFilter {
    /// Filter over a time window with defaults for everything else
    pub fn window(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            script_name: None,
            level: None,
            since,
            until,
            limit: 100,
            search: None,
            outcome: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.since > self.until {
            return Err(WatchError::InvalidFilter(format!(
                "since {} is after until {}",
                self.since, self.until
            )));
        }
        if self.limit == 0 {
            return Err(WatchError::InvalidFilter("limit must be >= 1".to_string()));
        }
        Ok(())
    }

    /// True when `timestamp` lies inside the filter's closed window
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.since && timestamp <= self.until
    }
}
