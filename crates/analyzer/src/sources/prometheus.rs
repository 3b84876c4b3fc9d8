//! Prometheus client for firing alerts.
//!
//! Alerts are read from the synthetic `ALERTS` series, which Prometheus keeps
//! for every pending or firing alerting rule with the rule's labels attached.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::{AlertRecord, AlertSource};
use crate::target::ResolvedTarget;

/// Default Prometheus service URL (internal Kubernetes DNS)
const DEFAULT_PROMETHEUS_URL: &str = "http://prometheus-server.observability.svc.cluster.local:80";

/// Configuration for the Prometheus client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    /// Base URL for the Prometheus API
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("PROMETHEUS_URL")
                .unwrap_or_else(|_| DEFAULT_PROMETHEUS_URL.to_string()),
            timeout_secs: 30,
        }
    }
}

/// Prometheus query response
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    metric: HashMap<String, String>,
}

/// Prometheus client for alert queries
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    config: PrometheusConfig,
    client: reqwest::Client,
}

impl PrometheusClient {
    /// Create a new Prometheus client with the given configuration.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new(config: PrometheusConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }

    /// Execute an instant query and return the label sets of a vector result.
    ///
    /// # Errors
    /// Returns an error if the query fails, the response cannot be parsed,
    /// or the result is not an instant vector.
    pub async fn query_vector(&self, query: &str) -> Result<Vec<HashMap<String, String>>> {
        let url = format!(
            "{}/api/v1/query",
            self.config.base_url.trim_end_matches('/')
        );

        debug!(query = %query, "Executing Prometheus query");

        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .context("Failed to send request to Prometheus")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Prometheus query failed with status {status}: {body}");
        }

        let prom_response: PrometheusResponse = response
            .json()
            .await
            .context("Failed to parse Prometheus response")?;

        if prom_response.status != "success" {
            anyhow::bail!("Prometheus query returned status: {}", prom_response.status);
        }
        if prom_response.data.result_type != "vector" {
            anyhow::bail!(
                "Prometheus query returned {} instead of vector",
                prom_response.data.result_type
            );
        }

        Ok(prom_response
            .data
            .result
            .into_iter()
            .map(|r| r.metric)
            .collect())
    }
}

/// PromQL selecting the firing alerts of a target.
#[must_use]
pub fn firing_alerts_query(target: &ResolvedTarget) -> String {
    format!(
        r#"ALERTS{{alertstate="firing", {}}}"#,
        target.stream_matchers()
    )
}

#[async_trait]
impl AlertSource for PrometheusClient {
    async fn firing_alerts(&self, target: &ResolvedTarget) -> Result<Vec<AlertRecord>> {
        let query = firing_alerts_query(target);
        let series = self.query_vector(&query).await?;

        let mut alerts: Vec<AlertRecord> = series
            .into_iter()
            .filter(|metric| metric.get("alertstate").map_or(true, |s| s == "firing"))
            .map(|mut metric| AlertRecord {
                alert_name: metric.remove("alertname").unwrap_or_default(),
                namespace: metric
                    .remove("namespace")
                    .unwrap_or_else(|| target.namespace.clone()),
                pod: metric.remove("pod").filter(|p| !p.is_empty()),
            })
            .collect();

        alerts.sort_by(|a, b| {
            a.alert_name
                .cmp(&b.alert_name)
                .then_with(|| a.pod.cmp(&b.pod))
        });

        debug!(count = alerts.len(), "Firing alerts for target");
        Ok(alerts)
    }
}
