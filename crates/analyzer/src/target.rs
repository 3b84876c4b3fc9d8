//! Workload targets and selector rendering.
//!
//! A [`Target`] is what the caller supplies (namespace + Kubernetes label
//! selector). Resolving it produces a [`ResolvedTarget`] holding the three
//! renderings the evidence sources need: the Kubernetes list selector, and the
//! label matchers shared by PromQL and LogQL stream selectors.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::AnalyzerError;

/// Namespace used when the target does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// RFC 1123 label: namespaces and label-key prefix segments
static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Label key name part and label values
static LABEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").unwrap());

const MAX_LABEL_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// The workload under observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub selector: LabelSelector,
}

/// A target validated and rendered for the evidence sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTarget {
    pub namespace: String,
    /// Kubernetes label selector string (`app=web,tier in (a,b)`)
    pub label_selector: String,
    /// Equality labels, used for alert and log stream matching
    pub match_labels: BTreeMap<String, String>,
}

impl Target {
    /// Build a target from a namespace and equality labels.
    #[must_use]
    pub fn new(namespace: impl Into<String>, match_labels: BTreeMap<String, String>) -> Self {
        Self {
            namespace: namespace.into(),
            selector: LabelSelector {
                match_labels: Some(match_labels),
                match_expressions: None,
            },
        }
    }

    /// Load a target from a YAML or JSON file shaped like an analyzer `spec.target`.
    pub fn from_file(path: &Path) -> Result<Self, AnalyzerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AnalyzerError::Resolution(format!("cannot read {}: {e}", path.display()))
        })?;
        // YAML is a superset of JSON
        serde_yaml::from_str(&content).map_err(|e| {
            AnalyzerError::Resolution(format!("cannot parse {}: {e}", path.display()))
        })
    }

    /// Resolve into the renderings used by the evidence sources.
    pub fn resolve(&self) -> Result<ResolvedTarget, AnalyzerError> {
        let namespace = if self.namespace.trim().is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            self.namespace.trim().to_string()
        };
        validate_namespace(&namespace)?;

        let match_labels = self.selector.match_labels.clone().unwrap_or_default();
        let expressions = self
            .selector
            .match_expressions
            .as_deref()
            .unwrap_or_default();

        if match_labels.is_empty() && expressions.is_empty() {
            return Err(AnalyzerError::Resolution(
                "target has no label selector".to_string(),
            ));
        }

        let mut parts = Vec::with_capacity(match_labels.len() + expressions.len());
        for (key, value) in &match_labels {
            validate_label_key(key)?;
            validate_label_value(key, value)?;
            parts.push(format!("{key}={value}"));
        }
        for requirement in expressions {
            parts.push(render_requirement(requirement)?);
        }

        Ok(ResolvedTarget {
            namespace,
            label_selector: parts.join(","),
            match_labels,
        })
    }
}

fn render_requirement(req: &LabelSelectorRequirement) -> Result<String, AnalyzerError> {
    validate_label_key(&req.key)?;
    let values = req.values.as_deref().unwrap_or_default();
    for value in values {
        validate_label_value(&req.key, value)?;
    }

    match req.operator.as_str() {
        "In" | "NotIn" => {
            if values.is_empty() {
                return Err(AnalyzerError::Resolution(format!(
                    "operator {} on {} requires values",
                    req.operator, req.key
                )));
            }
            let op = if req.operator == "In" { "in" } else { "notin" };
            Ok(format!("{} {op} ({})", req.key, values.join(",")))
        }
        "Exists" => Ok(req.key.clone()),
        "DoesNotExist" => Ok(format!("!{}", req.key)),
        other => Err(AnalyzerError::Resolution(format!(
            "unsupported selector operator {other:?}"
        ))),
    }
}

impl ResolvedTarget {
    /// Label matchers for PromQL/LogQL, without the surrounding braces.
    ///
    /// Always starts with the namespace; label names are mapped onto the
    /// Prometheus label-name alphabet and values are quoted.
    #[must_use]
    pub fn stream_matchers(&self) -> String {
        let mut matchers = vec![format!(r#"namespace="{}""#, escape_value(&self.namespace))];
        for (key, value) in &self.match_labels {
            matchers.push(format!(
                r#"{}="{}""#,
                sanitize_label_name(key),
                escape_value(value)
            ));
        }
        matchers.join(", ")
    }
}

/// Parse a `k=v,k2=v2` CLI selector into equality labels.
pub fn parse_selector_arg(arg: &str) -> Result<BTreeMap<String, String>, AnalyzerError> {
    let mut labels = BTreeMap::new();
    for pair in arg.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(AnalyzerError::Resolution(format!(
                "selector entry {pair:?} is not key=value"
            )));
        };
        let (key, value) = (key.trim(), value.trim());
        validate_label_key(key)?;
        validate_label_value(key, value)?;
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}

fn validate_namespace(namespace: &str) -> Result<(), AnalyzerError> {
    if namespace.len() > MAX_LABEL_LEN || !DNS_LABEL.is_match(namespace) {
        return Err(AnalyzerError::Resolution(format!(
            "namespace {namespace:?} is not a valid RFC 1123 label"
        )));
    }
    Ok(())
}

/// `[prefix/]name`, prefix a DNS subdomain.
fn validate_label_key(key: &str) -> Result<(), AnalyzerError> {
    let invalid = || AnalyzerError::Resolution(format!("label key {key:?} is not valid"));

    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.len() > MAX_PREFIX_LEN
                || !prefix
                    .split('.')
                    .all(|segment| segment.len() <= MAX_LABEL_LEN && DNS_LABEL.is_match(segment))
            {
                return Err(invalid());
            }
            name
        }
        None => key,
    };
    if name.len() > MAX_LABEL_LEN || !LABEL_NAME.is_match(name) {
        return Err(invalid());
    }
    Ok(())
}

fn validate_label_value(key: &str, value: &str) -> Result<(), AnalyzerError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_LABEL_LEN || !LABEL_NAME.is_match(value) {
        return Err(AnalyzerError::Resolution(format!(
            "value {value:?} of label {key:?} is not valid"
        )));
    }
    Ok(())
}

fn sanitize_label_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn escape_value(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', r#"\""#)
}
