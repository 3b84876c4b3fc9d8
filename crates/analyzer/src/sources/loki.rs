//! Loki client for recent error logs.
//!
//! Error lines are selected with a case-insensitive line filter over the
//! target's log streams, looking back a fixed window from "now".

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LogRecord, LogSource};
use crate::target::ResolvedTarget;

/// Default Loki service URL (internal Kubernetes DNS)
const DEFAULT_LOKI_URL: &str = "http://loki.logging.svc.cluster.local:3100";

/// Line filter selecting error-severity log lines
pub const ERROR_LINE_FILTER: &str = "(?i)(error|panic|fatal|critical)";

/// Multi-tenant scoping header
const TENANT_HEADER: &str = "X-Scope-OrgID";

/// Configuration for the Loki client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LokiConfig {
    /// Base URL for the Loki API
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Tenant sent as `X-Scope-OrgID`, for multi-tenant deployments
    pub tenant_id: Option<String>,
    /// Trailing look-back window in minutes
    pub window_mins: i64,
    /// Maximum number of lines returned per query
    pub limit: u32,
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("LOKI_URL").unwrap_or_else(|_| DEFAULT_LOKI_URL.to_string()),
            timeout_secs: 30,
            tenant_id: None,
            window_mins: 48,
            limit: 200,
        }
    }
}

/// Loki query response structure
#[derive(Debug, Deserialize)]
struct LokiResponse {
    status: String,
    data: LokiData,
}

#[derive(Debug, Deserialize)]
struct LokiData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<LokiStream>,
}

#[derive(Debug, Deserialize)]
struct LokiStream {
    values: Vec<(String, String)>, // (timestamp_ns, line)
}

/// Client for querying Grafana Loki
#[derive(Debug, Clone)]
pub struct LokiClient {
    config: LokiConfig,
    client: reqwest::Client,
}

impl LokiClient {
    /// Create a new Loki client with the given configuration
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created (should never happen in practice).
    #[must_use]
    pub fn new(config: LokiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }

    /// Execute a raw `LogQL` range query.
    ///
    /// Returns at most `config.limit` of the most recent entries, sorted
    /// oldest first.
    ///
    /// # Errors
    /// Returns an error if the Loki query fails, the response cannot be parsed,
    /// or the result is not a stream set.
    pub async fn query_logs(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LogRecord>> {
        // Loki takes nanosecond timestamps
        let start_ns = start.timestamp_nanos_opt().unwrap_or(0);
        let end_ns = end.timestamp_nanos_opt().unwrap_or(0);

        let url = format!(
            "{}/loki/api/v1/query_range",
            self.config.base_url.trim_end_matches('/')
        );

        debug!(
            query = %query,
            start = %start,
            end = %end,
            limit = self.config.limit,
            "Querying Loki"
        );

        let mut request = self.client.get(&url).query(&[
            ("query", query),
            ("start", &start_ns.to_string()),
            ("end", &end_ns.to_string()),
            ("limit", &self.config.limit.to_string()),
            ("direction", "backward"),
        ]);
        if let Some(tenant) = self.config.tenant_id.as_deref().filter(|t| !t.is_empty()) {
            request = request.header(TENANT_HEADER, tenant);
        }

        let response = request
            .send()
            .await
            .context("Failed to send request to Loki")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Loki query failed with status {status}: {body}");
        }

        let loki_response: LokiResponse = response
            .json()
            .await
            .context("Failed to parse Loki response")?;

        if loki_response.status != "success" {
            anyhow::bail!("Loki query returned status: {}", loki_response.status);
        }
        if loki_response.data.result_type != "streams" {
            anyhow::bail!(
                "Loki query returned {} instead of streams",
                loki_response.data.result_type
            );
        }

        let mut entries = Vec::new();
        for stream in loki_response.data.result {
            for (timestamp_ns, line) in stream.values {
                if let Some(timestamp) = parse_timestamp_ns(&timestamp_ns) {
                    entries.push(LogRecord { timestamp, line });
                }
            }
        }

        // Streams are merged, so re-apply the limit across all of them
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(self.config.limit as usize);
        entries.reverse();

        debug!(entries = entries.len(), "Retrieved log entries from Loki");
        Ok(entries)
    }
}

fn parse_timestamp_ns(raw: &str) -> Option<DateTime<Utc>> {
    let ns = raw.parse::<i64>().ok()?;
    let secs = ns.div_euclid(1_000_000_000);
    let nsecs = ns.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, nsecs)
}

/// LogQL selecting the error lines of a target.
#[must_use]
pub fn error_logs_query(target: &ResolvedTarget) -> String {
    format!(
        r#"{{{}}} |~ "{ERROR_LINE_FILTER}""#,
        target.stream_matchers()
    )
}

#[async_trait]
impl LogSource for LokiClient {
    async fn error_logs(&self, target: &ResolvedTarget) -> Result<Vec<LogRecord>> {
        let end = Utc::now();
        let minutes = self.config.window_mins;
        let window = Duration::try_minutes(minutes)
            .with_context(|| format!("Loki window of {minutes} minutes is out of range"))?;
        let start = end
            .checked_sub_signed(window)
            .context("Loki window reaches before the representable time range")?;
        self.query_logs(&error_logs_query(target), start, end).await
    }
}
