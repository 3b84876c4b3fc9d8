//! Evidence sources.
//!
//! Each source answers one question about a [`ResolvedTarget`]: which pods
//! exist, which alerts are firing, which error lines were logged recently.
//! Sources return `anyhow::Result`; the aggregator decides what a failure means.

pub mod loki;
pub mod pods;
pub mod prometheus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;

use crate::target::ResolvedTarget;

pub use self::loki::{LokiClient, LokiConfig};
pub use self::pods::{KubePodSource, UnavailablePodSource};
pub use self::prometheus::{PrometheusClient, PrometheusConfig};

/// A firing alert scoped to the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertRecord {
    pub alert_name: String,
    pub namespace: String,
    /// Pod the alert fired for, when the alert carries one
    pub pod: Option<String>,
}

/// An error-severity log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Lists the raw pods a target selects.
#[async_trait]
pub trait PodSource: Send + Sync {
    async fn list_pods(&self, target: &ResolvedTarget) -> anyhow::Result<Vec<Pod>>;
}

/// Reports alerts currently firing for a target.
#[async_trait]
pub trait AlertSource: Send + Sync {
    async fn firing_alerts(&self, target: &ResolvedTarget) -> anyhow::Result<Vec<AlertRecord>>;
}

/// Returns recent error/fatal log lines for a target, oldest first.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn error_logs(&self, target: &ResolvedTarget) -> anyhow::Result<Vec<LogRecord>>;
}
