//! Request text rendering using Handlebars.
//!
//! The template is compiled into the binary and registered once. Caller data
//! only fills placeholders; the output schema section is literal template text.

use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde::Serialize;

use crate::config::WorkloadBaseline;
use crate::error::AnalyzerError;
use crate::evidence::EvidenceReport;
use crate::target::ResolvedTarget;

const TEMPLATE_NAME: &str = "request";

/// Timestamp format shared by the request text and patch file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

const REQUEST_TEMPLATE: &str = r#"### Current workload (use these values verbatim)
- Label selector: {{label_selector}}
- Namespace: {{namespace}}
- Current replicas: {{replicas}}
- Current CPU limits: {{cpu_limits}}
- Current CPU requests: {{cpu_requests}}
- Current memory limits: {{memory_limits}}
- Current memory requests: {{memory_requests}}
- Current time: {{current_time}}

### Alerts and monitoring data
{{evidence}}
### Decision
Decide now whether self-healing is needed. If it is, output exactly one JSON object in this format and nothing else:

{
  "action": "heal",
  "namespace": "{{namespace}}",
  "reason": "one-sentence reason, used as the git commit subject (at most 50 characters)",
  "detail": "technical explanation of the problem and a summary of the fix, used as the pull request body (at most 300 characters)",
  "patch_file": "{{current_time}}-cpu-spike.yaml",
  "patch_content": [
    {
      "op": "replace",
      "path": "/spec/replicas",
      "value": 2
    }
  ],
  "target": {
    "kind": "Deployment",
    "labelSelector": "{{label_selector}}"
  },
  "suggested_duration": "30m",
  "risk_level": "low" | "medium" | "high"
}

op must be one of replace, add, remove. risk_level must be exactly one of low, medium, high.

If no self-healing is needed, output:
{
  "action": "noop",
  "reason": "metrics are normal, no intervention needed"
}
"#;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Serialize)]
struct RequestContext<'a> {
    label_selector: &'a str,
    namespace: &'a str,
    replicas: String,
    cpu_limits: &'a str,
    cpu_requests: &'a str,
    memory_limits: &'a str,
    memory_requests: &'a str,
    current_time: String,
    evidence: String,
}

/// Renders the request text sent to the reasoning service.
pub struct PromptBuilder {
    handlebars: Handlebars<'static>,
    baseline: WorkloadBaseline,
}

impl PromptBuilder {
    pub fn new(baseline: WorkloadBaseline) -> Result<Self, AnalyzerError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string(TEMPLATE_NAME, REQUEST_TEMPLATE)
            .map_err(|e| AnalyzerError::Prompt(e.to_string()))?;

        Ok(Self {
            handlebars,
            baseline,
        })
    }

    /// Render the request for one run. Same inputs, same output.
    pub fn build(
        &self,
        target: &ResolvedTarget,
        evidence: &EvidenceReport,
        now: DateTime<Utc>,
    ) -> Result<String, AnalyzerError> {
        let baseline = &self.baseline;
        let context = RequestContext {
            label_selector: &target.label_selector,
            namespace: &target.namespace,
            replicas: baseline
                .replicas
                .map_or_else(|| UNKNOWN.to_string(), |r| r.to_string()),
            cpu_limits: baseline.cpu_limits.as_deref().unwrap_or(UNKNOWN),
            cpu_requests: baseline.cpu_requests.as_deref().unwrap_or(UNKNOWN),
            memory_limits: baseline.memory_limits.as_deref().unwrap_or(UNKNOWN),
            memory_requests: baseline.memory_requests.as_deref().unwrap_or(UNKNOWN),
            current_time: now.format(TIMESTAMP_FORMAT).to_string(),
            evidence: evidence.render(),
        };

        self.handlebars
            .render(TEMPLATE_NAME, &context)
            .map_err(|e| AnalyzerError::Prompt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::SectionBody;
    use crate::target::Target;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn target() -> ResolvedTarget {
        Target::new(
            "product-a",
            BTreeMap::from([(
                "app.kubernetes.io/name".to_string(),
                "order-service".to_string(),
            )]),
        )
        .resolve()
        .unwrap()
    }

    fn report() -> EvidenceReport {
        EvidenceReport {
            resources: SectionBody::Empty,
            alerts: SectionBody::Present(
                "Alert: HighCpu\n  Namespace: product-a\n\n".to_string(),
            ),
            logs: SectionBody::Present(
                "2025-11-26T12:00:00.000Z: error \"quoted\" <tag> & more\n".to_string(),
            ),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 26, 20, 45, 55).unwrap()
    }

    #[test]
    fn test_renders_facts_evidence_and_schema() {
        let builder = PromptBuilder::new(WorkloadBaseline {
            replicas: Some(1),
            cpu_limits: Some("2000m".to_string()),
            cpu_requests: Some("1000m".to_string()),
            memory_limits: Some("4Gi".to_string()),
            memory_requests: None,
        })
        .unwrap();

        let text = builder.build(&target(), &report(), now()).unwrap();

        assert!(text.contains("- Label selector: app.kubernetes.io/name=order-service\n"));
        assert!(text.contains("- Namespace: product-a\n"));
        assert!(text.contains("- Current replicas: 1\n"));
        assert!(text.contains("- Current CPU limits: 2000m\n"));
        assert!(text.contains("- Current memory requests: unknown\n"));
        assert!(text.contains("- Current time: 20251126-204555\n"));
        assert!(text.contains("\"patch_file\": \"20251126-204555-cpu-spike.yaml\""));
        assert!(text.contains(&report().render()));
        assert!(text.contains(r#""risk_level": "low" | "medium" | "high""#));
    }

    #[test]
    fn test_evidence_is_not_html_escaped() {
        let builder = PromptBuilder::new(WorkloadBaseline::default()).unwrap();
        let text = builder.build(&target(), &report(), now()).unwrap();
        assert!(text.contains(r#"error "quoted" <tag> & more"#));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let builder = PromptBuilder::new(WorkloadBaseline::default()).unwrap();
        let first = builder.build(&target(), &report(), now()).unwrap();
        let second = builder.build(&target(), &report(), now()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_evidence_cannot_inject_template_syntax() {
        let builder = PromptBuilder::new(WorkloadBaseline::default()).unwrap();
        let hostile = EvidenceReport {
            resources: SectionBody::Empty,
            alerts: SectionBody::Empty,
            logs: SectionBody::Present("{{namespace}} {{#each x}}\n".to_string()),
        };
        let text = builder.build(&target(), &hostile, now()).unwrap();
        assert!(text.contains("{{namespace}} {{#each x}}"));
    }
}
