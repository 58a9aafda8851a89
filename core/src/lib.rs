// Flarewatch Core Library
// Telemetry aggregation and log streaming for a serverless workers dashboard

pub mod aggregate;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod logs;
pub mod query;
pub mod stream;

// Export core types
pub use aggregate::{AggregateSnapshot, Aggregator, AuditSummary, BuildStats, FleetMetrics};
pub use client::{AuditEvent, TelemetryBackend, TelemetryClient, WorkerDescriptor};
pub use config::{Credentials, StreamConfig, TelemetryConfig};
pub use logs::{normalize, EventType, LogEntry, LogFilter, LogLevel, WorkerException};
pub use query::QueryEngine;
pub use stream::LogStreamManager;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("telemetry backend unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("telemetry backend rejected query: {0}")]
    UpstreamRejected(String),

    #[error("malformed telemetry record: {0}")]
    MalformedRecord(String),

    #[error("stream subscriber disconnected")]
    SubscriberGone,

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WatchError>;
