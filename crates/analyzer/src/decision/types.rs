//! Decision outcome types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DecisionError;

/// The validated result of one reasoning round.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DecisionOutcome {
    Heal(HealAction),
    Noop(NoopAction),
}

impl DecisionOutcome {
    /// The `action` discriminant value.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Heal(_) => "heal",
            Self::Noop(_) => "noop",
        }
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Heal(heal) => &heal.reason,
            Self::Noop(noop) => &noop.reason,
        }
    }
}

/// "Nothing to do", with the service's justification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoopAction {
    pub reason: String,
}

/// A remediation proposal awaiting human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealAction {
    pub namespace: String,
    /// One-line reason, suitable as a commit subject
    pub reason: String,
    /// Technical explanation and remediation summary
    pub detail: String,
    /// `YYYYMMDD-HHMMSS-<short-description>.yaml`
    #[serde(rename = "patch_file")]
    pub patch_file_name: String,
    #[serde(rename = "patch_content")]
    pub patch_operations: Vec<PatchOperation>,
    pub target: HealTarget,
    pub suggested_duration: String,
    pub risk_level: RiskLevel,
}

/// Workload the patch applies to, located by selector rather than name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealTarget {
    pub kind: String,
    #[serde(rename = "labelSelector")]
    pub label_selector: String,
}

/// One JSON-Patch-style edit. `value` is forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl fmt::Display for PatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{} {} = {value}", self.op, self.path),
            None => write!(f, "{} {}", self.op, self.path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Replace,
    Add,
    Remove,
}

impl PatchOp {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchOp {
    type Err = DecisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(Self::Replace),
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            other => Err(DecisionError::validation(
                "patch_content.op",
                format!("{other:?} is not one of replace, add, remove"),
            )),
        }
    }
}

/// Severity classification gating human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = DecisionError;

    /// Exact, lowercase match. Nothing is clamped or defaulted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(DecisionError::validation(
                "risk_level",
                format!("{other:?} is not one of low, medium, high"),
            )),
        }
    }
}

/// What a notification needs to know about a proposal.
///
/// Implemented by proposal types so card construction reads fields through
/// static dispatch.
pub trait RemediationProposal {
    fn reason(&self) -> &str;
    fn target_kind(&self) -> &str;
    fn target_selector(&self) -> &str;
    fn namespace(&self) -> &str;
    fn detail(&self) -> &str;
    fn patch_file_name(&self) -> &str;
    fn patch_operations(&self) -> &[PatchOperation];
}

impl RemediationProposal for HealAction {
    fn reason(&self) -> &str {
        &self.reason
    }

    fn target_kind(&self) -> &str {
        &self.target.kind
    }

    fn target_selector(&self) -> &str {
        &self.target.label_selector
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn detail(&self) -> &str {
        &self.detail
    }

    fn patch_file_name(&self) -> &str {
        &self.patch_file_name
    }

    fn patch_operations(&self) -> &[PatchOperation] {
        &self.patch_operations
    }
}
