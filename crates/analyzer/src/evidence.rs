//! Evidence aggregation.
//!
//! Queries the three evidence sources for one target and concatenates their
//! output into a report with a fixed section order:
//! - `=== Target Resource Information ===` (filtered pods as YAML)
//! - `=== Prometheus Alerts ===`
//! - `=== Loki Error Logs ===`
//!
//! A failing or timed-out source degrades to a "Source unavailable" line.
//! Only when all three fail does aggregation itself fail.

use chrono::SecondsFormat;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AnalyzerError;
use crate::guard::{self, Interrupted};
use crate::snapshot;
use crate::sources::{AlertRecord, AlertSource, LogRecord, LogSource, PodSource};
use crate::target::ResolvedTarget;

pub const RESOURCES_HEADER: &str = "=== Target Resource Information ===";
pub const ALERTS_HEADER: &str = "=== Prometheus Alerts ===";
pub const LOGS_HEADER: &str = "=== Loki Error Logs ===";

pub const NO_PODS: &str = "No matching pods";
pub const NO_ALERTS: &str = "No firing alerts";
pub const NO_LOGS: &str = "No error logs";

/// Prefix of the line replacing a failed source's block
pub const UNAVAILABLE_PREFIX: &str = "Source unavailable:";

/// Maximum alerts listed before truncation
pub const MAX_ALERTS: usize = 50;

/// Content of one report section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionBody {
    /// Formatted records, newline terminated
    Present(String),
    /// The source answered with no records
    Empty,
    /// The source failed; carries the reason
    Unavailable(String),
}

impl SectionBody {
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    fn write_to(&self, out: &mut String, none_line: &str) {
        match self {
            Self::Present(block) => {
                out.push_str(block);
                if !block.ends_with('\n') {
                    out.push('\n');
                }
            }
            Self::Empty => {
                out.push_str(none_line);
                out.push('\n');
            }
            Self::Unavailable(reason) => {
                let _ = writeln!(out, "{UNAVAILABLE_PREFIX} {reason}");
            }
        }
    }
}

/// The three-section evidence report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceReport {
    pub resources: SectionBody,
    pub alerts: SectionBody,
    pub logs: SectionBody,
}

impl EvidenceReport {
    /// Render the report text. Section order never varies.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(RESOURCES_HEADER);
        out.push('\n');
        self.resources.write_to(&mut out, NO_PODS);

        out.push('\n');
        out.push_str(ALERTS_HEADER);
        out.push('\n');
        self.alerts.write_to(&mut out, NO_ALERTS);

        out.push('\n');
        out.push_str(LOGS_HEADER);
        out.push('\n');
        self.logs.write_to(&mut out, NO_LOGS);
        out
    }

    /// Names of the sections whose source failed.
    #[must_use]
    pub fn unavailable_sections(&self) -> Vec<&'static str> {
        [
            ("resources", &self.resources),
            ("alerts", &self.alerts),
            ("logs", &self.logs),
        ]
        .into_iter()
        .filter(|(_, body)| body.is_unavailable())
        .map(|(name, _)| name)
        .collect()
    }
}

impl fmt::Display for EvidenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Per-source call limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLimits {
    pub pods_timeout: Duration,
    pub alerts_timeout: Duration,
    pub logs_timeout: Duration,
    pub max_log_lines: usize,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            pods_timeout: Duration::from_secs(30),
            alerts_timeout: Duration::from_secs(30),
            logs_timeout: Duration::from_secs(30),
            max_log_lines: 200,
        }
    }
}

/// Runs the three sources concurrently and assembles the report.
#[derive(Clone)]
pub struct EvidenceAggregator {
    pods: Arc<dyn PodSource>,
    alerts: Arc<dyn AlertSource>,
    logs: Arc<dyn LogSource>,
    limits: SourceLimits,
}

impl EvidenceAggregator {
    #[must_use]
    pub fn new(
        pods: Arc<dyn PodSource>,
        alerts: Arc<dyn AlertSource>,
        logs: Arc<dyn LogSource>,
    ) -> Self {
        Self {
            pods,
            alerts,
            logs,
            limits: SourceLimits::default(),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: SourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Gather evidence for `target`.
    ///
    /// # Errors
    /// `Cancelled` if `cancel` fires, `EvidenceUnavailable` if every source failed.
    pub async fn aggregate(
        &self,
        target: &ResolvedTarget,
        cancel: &CancellationToken,
    ) -> Result<EvidenceReport, AnalyzerError> {
        let (pods, alerts, logs) = tokio::join!(
            guard::bounded(self.limits.pods_timeout, cancel, self.pods.list_pods(target)),
            guard::bounded(
                self.limits.alerts_timeout,
                cancel,
                self.alerts.firing_alerts(target)
            ),
            guard::bounded(self.limits.logs_timeout, cancel, self.logs.error_logs(target)),
        );

        let report = EvidenceReport {
            resources: section("resources", pods, |pods| {
                let observations: Vec<_> = pods.iter().map(snapshot::filter).collect();
                snapshot::render_observations(&observations)
            })?,
            alerts: section("alerts", alerts, |alerts| format_alerts(&alerts))?,
            logs: section("logs", logs, |logs| {
                format_logs(&logs, self.limits.max_log_lines)
            })?,
        };

        if let (
            SectionBody::Unavailable(resources),
            SectionBody::Unavailable(alerts),
            SectionBody::Unavailable(logs),
        ) = (&report.resources, &report.alerts, &report.logs)
        {
            return Err(AnalyzerError::EvidenceUnavailable {
                resources: resources.clone(),
                alerts: alerts.clone(),
                logs: logs.clone(),
            });
        }

        info!(
            namespace = %target.namespace,
            unavailable = ?report.unavailable_sections(),
            "Evidence gathered"
        );
        Ok(report)
    }
}

/// Turn one guarded source result into a section body.
fn section<T>(
    name: &'static str,
    result: Result<anyhow::Result<Vec<T>>, Interrupted>,
    format: impl FnOnce(Vec<T>) -> String,
) -> Result<SectionBody, AnalyzerError> {
    match result {
        Err(Interrupted::Cancelled) => Err(AnalyzerError::Cancelled),
        Err(timeout @ Interrupted::Timeout(_)) => {
            warn!(source = name, "Evidence source {timeout}");
            Ok(SectionBody::Unavailable(timeout.to_string()))
        }
        Ok(Err(e)) => {
            warn!(source = name, error = %format!("{e:#}"), "Evidence source failed");
            Ok(SectionBody::Unavailable(format!("{e:#}")))
        }
        Ok(Ok(records)) if records.is_empty() => {
            debug!(source = name, "Evidence source returned no records");
            Ok(SectionBody::Empty)
        }
        Ok(Ok(records)) => {
            debug!(source = name, count = records.len(), "Evidence source returned records");
            Ok(SectionBody::Present(format(records)))
        }
    }
}

/// One stanza per alert, first [`MAX_ALERTS`] only.
#[must_use]
pub fn format_alerts(alerts: &[AlertRecord]) -> String {
    let mut out = String::new();
    for alert in alerts.iter().take(MAX_ALERTS) {
        let _ = writeln!(out, "Alert: {}", alert.alert_name);
        let _ = writeln!(out, "  Namespace: {}", alert.namespace);
        if let Some(pod) = &alert.pod {
            let _ = writeln!(out, "  Pod: {pod}");
        }
        out.push('\n');
    }
    if alerts.len() > MAX_ALERTS {
        let _ = writeln!(out, "... ({} more omitted)", alerts.len() - MAX_ALERTS);
    }
    out
}

/// `timestamp: line` per entry, keeping the most recent `max_lines`.
///
/// Input is expected oldest first, and so is the output.
#[must_use]
pub fn format_logs(logs: &[LogRecord], max_lines: usize) -> String {
    let skipped = logs.len().saturating_sub(max_lines);
    let mut out = String::new();
    if skipped > 0 {
        let _ = writeln!(out, "... ({skipped} more omitted)");
    }
    for entry in &logs[skipped..] {
        let _ = writeln!(
            out,
            "{}: {}",
            entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            entry.line.trim_end()
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::core::v1::Pod;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::target::Target;

    const SOURCE_DELAY: Duration = Duration::from_millis(300);

    /// Every source answers empty after [`SOURCE_DELAY`], tracking overlap.
    #[derive(Default)]
    struct SlowSources {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowSources {
        async fn answer<T>(&self) -> anyhow::Result<Vec<T>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(SOURCE_DELAY).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl PodSource for SlowSources {
        async fn list_pods(&self, _target: &ResolvedTarget) -> anyhow::Result<Vec<Pod>> {
            self.answer().await
        }
    }

    #[async_trait]
    impl AlertSource for SlowSources {
        async fn firing_alerts(&self, _target: &ResolvedTarget) -> anyhow::Result<Vec<AlertRecord>> {
            self.answer().await
        }
    }

    #[async_trait]
    impl LogSource for SlowSources {
        async fn error_logs(&self, _target: &ResolvedTarget) -> anyhow::Result<Vec<LogRecord>> {
            self.answer().await
        }
    }

    fn log(secs: i64, line: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            line: line.to_string(),
        }
    }

    #[test]
    fn test_render_empty_report_keeps_all_headers() {
        let report = EvidenceReport {
            resources: SectionBody::Empty,
            alerts: SectionBody::Empty,
            logs: SectionBody::Empty,
        };
        assert_eq!(
            report.render(),
            "=== Target Resource Information ===\nNo matching pods\n\n\
             === Prometheus Alerts ===\nNo firing alerts\n\n\
             === Loki Error Logs ===\nNo error logs\n"
        );
    }

    #[test]
    fn test_render_marks_unavailable_source() {
        let report = EvidenceReport {
            resources: SectionBody::Present("name: a\n---\n".to_string()),
            alerts: SectionBody::Unavailable("timed out after 5s".to_string()),
            logs: SectionBody::Present("x: y".to_string()),
        };
        let text = report.render();
        assert!(text.contains("=== Prometheus Alerts ===\nSource unavailable: timed out after 5s\n"));
        assert!(text.ends_with("x: y\n"));
        assert_eq!(report.unavailable_sections(), vec!["alerts"]);
    }

    #[test]
    fn test_format_alerts_stanzas() {
        let alerts = vec![
            AlertRecord {
                alert_name: "HighCpu".to_string(),
                namespace: "product-a".to_string(),
                pod: Some("order-1".to_string()),
            },
            AlertRecord {
                alert_name: "HighLatency".to_string(),
                namespace: "product-a".to_string(),
                pod: None,
            },
        ];
        assert_eq!(
            format_alerts(&alerts),
            "Alert: HighCpu\n  Namespace: product-a\n  Pod: order-1\n\n\
             Alert: HighLatency\n  Namespace: product-a\n\n"
        );
    }

    #[test]
    fn test_format_alerts_truncates() {
        let alerts: Vec<_> = (0..MAX_ALERTS + 3)
            .map(|i| AlertRecord {
                alert_name: format!("A{i}"),
                namespace: "ns".to_string(),
                pod: None,
            })
            .collect();
        let text = format_alerts(&alerts);
        assert_eq!(text.matches("Alert: ").count(), MAX_ALERTS);
        assert!(text.ends_with("... (3 more omitted)\n"));
    }

    #[test]
    fn test_format_logs_keeps_most_recent() {
        let logs = vec![log(10, "error a"), log(20, "error b\n"), log(30, "panic c")];
        assert_eq!(
            format_logs(&logs, 2),
            "... (1 more omitted)\n\
             1970-01-01T00:00:20.000Z: error b\n\
             1970-01-01T00:00:30.000Z: panic c\n"
        );
        assert_eq!(format_logs(&logs, 10).lines().count(), 3);
    }

    #[tokio::test]
    async fn test_sources_are_queried_concurrently() {
        let sources = Arc::new(SlowSources::default());
        let aggregator = EvidenceAggregator::new(sources.clone(), sources.clone(), sources.clone());
        let target = Target::new("ns", BTreeMap::from([("app".to_string(), "web".to_string())]))
            .resolve()
            .unwrap();

        let started = Instant::now();
        let report = aggregator
            .aggregate(&target, &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.resources, SectionBody::Empty);
        assert_eq!(sources.peak.load(Ordering::SeqCst), 3);
        assert!(
            elapsed < SOURCE_DELAY * 2,
            "aggregation took {elapsed:?}, sources ran one after another"
        );
    }
}
