// Configuration for the telemetry core
//
// Credentials come from the environment at startup; a missing API token is
// an immediate error rather than a deferred unauthenticated call.

use crate::{Result, WatchError};
use serde::{Deserialize, Serialize};

/// Account credentials for the remote telemetry API
#[derive(Debug, Clone)]
pub struct Credentials {
    pub account_id: String,
    pub api_token: String,
}

impl Credentials {
    /// Load credentials from `CLOUDFLARE_ACCOUNT_ID` / `CLOUDFLARE_API_TOKEN`.
    ///
    /// Fails fast with [`WatchError::MissingCredentials`] when either is
    /// absent or empty.
    pub fn from_env() -> Result<Self> {
        let account_id = env_nonempty("CLOUDFLARE_ACCOUNT_ID")?;
        let api_token = env_nonempty("CLOUDFLARE_API_TOKEN")?;
        Ok(Self {
            account_id,
            api_token,
        })
    }
}

fn env_nonempty(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(WatchError::MissingCredentials(name.to_string())),
    }
}

/// Transport configuration for the telemetry client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// REST API base URL
    pub api_base: String,
    /// GraphQL analytics endpoint
    pub graphql_endpoint: String,
    /// Timeout for every outbound call in milliseconds
    pub timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.cloudflare.com/client/v4".to_string(),
            graphql_endpoint: "https://api.cloudflare.com/client/v4/graphql".to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// Streaming session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Interval between polls in milliseconds
    pub poll_interval_ms: u64,
    /// Result cap per poll window
    pub poll_limit: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            poll_limit: 100,
        }
    }
}
