//! Two-phase decoding of reasoning-service responses.
//!
//! Phase one reads only the `action` discriminant. Phase two decodes the
//! variant it names and validates it. Invalid output is rejected, never
//! repaired: a heal proposal may gate an automated change.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::{debug, error};

use super::types::{
    DecisionOutcome, HealAction, HealTarget, NoopAction, PatchOp, PatchOperation, RiskLevel,
};
use crate::error::DecisionError;

/// `YYYYMMDD-HHMMSS-<short-description>.yaml`
static PATCH_FILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}-\d{6}-[a-z0-9][a-z0-9-]*\.yaml$").unwrap());

/// Workload kinds a proposal may patch.
pub const ALLOWED_TARGET_KINDS: &[&str] = &["Deployment", "StatefulSet", "HorizontalPodAutoscaler"];

#[derive(Debug, Deserialize)]
struct Discriminant {
    action: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHeal {
    namespace: String,
    reason: String,
    #[serde(default)]
    detail: String,
    patch_file: String,
    patch_content: Vec<RawPatch>,
    target: HealTarget,
    #[serde(default)]
    suggested_duration: String,
    risk_level: String,
}

#[derive(Debug, Deserialize)]
struct RawPatch {
    op: String,
    path: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

/// Parse and validate a raw response into a [`DecisionOutcome`].
pub fn parse(response: &str) -> Result<DecisionOutcome, DecisionError> {
    let text = strip_code_fence(response);

    let base: Discriminant = serde_json::from_str(text).map_err(|e| {
        error!(raw = %response, error = %e, "Reasoning response is not a decision document");
        DecisionError::Parse {
            reason: e.to_string(),
            raw: response.to_string(),
        }
    })?;

    let outcome = match base.action.as_str() {
        "heal" => {
            let raw: RawHeal = serde_json::from_str(text)
                .map_err(|e| DecisionError::validation("heal payload", e.to_string()))?;
            DecisionOutcome::Heal(validate_heal(raw)?)
        }
        "noop" => {
            let noop: NoopAction = serde_json::from_str(text)
                .map_err(|e| DecisionError::validation("reason", e.to_string()))?;
            DecisionOutcome::Noop(noop)
        }
        other => {
            error!(
                raw = %response,
                action = %other,
                reason = base.reason.as_deref().unwrap_or_default(),
                "Reasoning response names an unknown action"
            );
            return Err(DecisionError::UnknownAction(other.to_string()));
        }
    };

    debug!(action = outcome.action(), "Parsed reasoning response");
    Ok(outcome)
}

/// Unwrap a response wholly enclosed in a Markdown code fence.
fn strip_code_fence(response: &str) -> &str {
    let text = response.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop an info string such as `json` on the opening line
    match body.split_once('\n') {
        Some((info, content)) if !info.trim().contains(['{', '[']) => content.trim(),
        _ => body.trim(),
    }
}

fn validate_heal(raw: RawHeal) -> Result<HealAction, DecisionError> {
    let risk_level: RiskLevel = raw.risk_level.parse()?;

    if raw.namespace.trim().is_empty() {
        return Err(DecisionError::validation("namespace", "must not be empty"));
    }
    if raw.target.label_selector.trim().is_empty() {
        return Err(DecisionError::validation(
            "target.labelSelector",
            "must not be empty",
        ));
    }
    if !ALLOWED_TARGET_KINDS.contains(&raw.target.kind.as_str()) {
        return Err(DecisionError::validation(
            "target.kind",
            format!(
                "{:?} is not one of {}",
                raw.target.kind,
                ALLOWED_TARGET_KINDS.join(", ")
            ),
        ));
    }
    validate_patch_file(&raw.patch_file)?;

    if raw.patch_content.is_empty() {
        return Err(DecisionError::validation(
            "patch_content",
            "must contain at least one operation",
        ));
    }
    let patch_operations = raw
        .patch_content
        .into_iter()
        .enumerate()
        .map(|(i, p)| validate_patch(i, p))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HealAction {
        namespace: raw.namespace,
        reason: raw.reason,
        detail: raw.detail,
        patch_file_name: raw.patch_file,
        patch_operations,
        target: raw.target,
        suggested_duration: raw.suggested_duration,
        risk_level,
    })
}

fn validate_patch_file(name: &str) -> Result<(), DecisionError> {
    if !PATCH_FILE_PATTERN.is_match(name) {
        return Err(DecisionError::validation(
            "patch_file",
            format!("{name:?} does not match YYYYMMDD-HHMMSS-<short-description>.yaml"),
        ));
    }
    // The pattern guarantees 15 ASCII bytes of date and time up front
    NaiveDateTime::parse_from_str(&name[..15], "%Y%m%d-%H%M%S").map_err(|e| {
        DecisionError::validation(
            "patch_file",
            format!("{name:?} does not start with a real timestamp: {e}"),
        )
    })?;
    Ok(())
}

fn validate_patch(index: usize, raw: RawPatch) -> Result<PatchOperation, DecisionError> {
    let field = format!("patch_content[{index}]");
    let op: PatchOp = raw.op.parse().map_err(|_| {
        DecisionError::validation(
            format!("{field}.op"),
            format!("{:?} is not one of replace, add, remove", raw.op),
        )
    })?;

    if !raw.path.starts_with('/') {
        return Err(DecisionError::validation(
            format!("{field}.path"),
            format!("{:?} is not a JSON pointer", raw.path),
        ));
    }
    if op != PatchOp::Remove && raw.value.is_none() {
        return Err(DecisionError::validation(
            format!("{field}.value"),
            format!("required for {op}"),
        ));
    }

    Ok(PatchOperation {
        op,
        path: raw.path,
        value: raw.value,
    })
}
