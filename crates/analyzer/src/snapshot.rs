//! Compact, stable pod projections for the evidence report.
//!
//! Raw pod objects carry bookkeeping (resource version, UID, managed fields,
//! owner references, ...) that changes between otherwise identical runs. The
//! filter keeps identity and a one-condition, one-container status summary.

use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod, PodCondition};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::warn;

/// Delimiter written after every serialized pod.
pub const RECORD_DELIMITER: &str = "---\n";

/// Filtered projection of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodObservation {
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// The readiness condition, or the last reported condition when the pod
    /// has no `Ready` entry yet. Absent when the pod reports no conditions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ConditionSummary>,
    /// First container status. Absent before any container has been created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConditionSummary {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub name: String,
    pub ready: bool,
    pub restart_count: i32,
    /// `running`, `waiting`, `terminated` or `unknown`
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

/// Project a raw pod onto a [`PodObservation`]. Never fails.
#[must_use]
pub fn filter(pod: &Pod) -> PodObservation {
    let meta = &pod.metadata;
    let status = pod.status.as_ref();

    let readiness = status
        .and_then(|s| s.conditions.as_deref())
        .and_then(representative_condition)
        .map(|c| ConditionSummary {
            condition_type: c.type_.clone(),
            status: c.status.clone(),
        });

    let container = status
        .and_then(|s| s.container_statuses.as_deref())
        .and_then(<[ContainerStatus]>::first)
        .map(summarize_container);

    PodObservation {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()),
        readiness,
        container,
    }
}

fn representative_condition(conditions: &[PodCondition]) -> Option<&PodCondition> {
    conditions
        .iter()
        .find(|c| c.type_ == "Ready")
        .or_else(|| conditions.last())
}

fn summarize_container(cs: &ContainerStatus) -> ContainerSummary {
    let mut summary = ContainerSummary {
        name: cs.name.clone(),
        ready: cs.ready,
        restart_count: cs.restart_count,
        state: "unknown",
        reason: None,
        message: None,
        exit_code: None,
        started_at: None,
    };

    match cs.state.as_ref() {
        Some(ContainerState {
            running: Some(running),
            ..
        }) => {
            summary.state = "running";
            summary.started_at = running.started_at.as_ref().map(|t| t.0.to_rfc3339());
        }
        Some(ContainerState {
            waiting: Some(waiting),
            ..
        }) => {
            summary.state = "waiting";
            summary.reason.clone_from(&waiting.reason);
            summary.message.clone_from(&waiting.message);
        }
        Some(ContainerState {
            terminated: Some(terminated),
            ..
        }) => {
            summary.state = "terminated";
            summary.exit_code = Some(terminated.exit_code);
            summary.reason.clone_from(&terminated.reason);
            summary.message.clone_from(&terminated.message);
        }
        _ => {}
    }

    summary
}

/// Serialize observations as YAML documents, each followed by [`RECORD_DELIMITER`].
///
/// Returns an empty string for an empty slice. A pod that fails to serialize
/// is skipped with a warning.
#[must_use]
pub fn render_observations(observations: &[PodObservation]) -> String {
    let mut out = String::new();
    for obs in observations {
        match serde_yaml::to_string(obs) {
            Ok(yaml) => {
                let _ = write!(out, "{yaml}{RECORD_DELIMITER}");
            }
            Err(e) => warn!(pod = %obs.name, error = %e, "Failed to serialize pod observation"),
        }
    }
    out
}
