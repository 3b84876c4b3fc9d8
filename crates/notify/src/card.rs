//! Template card payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the messaging platform should interpret a receive ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveIdType {
    UserId,
    OpenId,
    UnionId,
    ChatId,
    Email,
}

impl ReceiveIdType {
    /// Query-string value expected by the messaging API.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UserId => "user_id",
            Self::OpenId => "open_id",
            Self::UnionId => "union_id",
            Self::ChatId => "chat_id",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for ReceiveIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiveIdType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_id" => Ok(Self::UserId),
            "open_id" => Ok(Self::OpenId),
            "union_id" => Ok(Self::UnionId),
            "chat_id" => Ok(Self::ChatId),
            "email" => Ok(Self::Email),
            other => Err(format!("unknown receive id type: {other}")),
        }
    }
}

/// One patch operation as shown on the card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardPatch {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Variables rendered by the approval card template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardVariables {
    /// Human-readable reason for the proposal
    pub reason: String,
    /// Patch operations rendered one per line, for audit
    pub patch: String,
    /// Structured patch operations
    pub patches: Vec<CardPatch>,
    /// Technical detail. The key name is fixed by the published card template.
    #[serde(rename = "resolve_fuction")]
    pub resolve_function: String,
    pub namespace: String,
    /// Kind of the targeted workload (Deployment, StatefulSet, ...)
    pub kind: String,
    /// Label selector of the targeted workload
    pub name: String,
    /// Unique approval request ID, echoed back by card callbacks
    pub request_id: String,
}

/// A template card addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardMessage {
    pub receive_id: String,
    pub receive_id_type: ReceiveIdType,
    pub template_id: String,
    pub template_version: String,
    pub variables: CardVariables,
}

impl CardMessage {
    #[must_use]
    pub fn new(
        receive_id: impl Into<String>,
        receive_id_type: ReceiveIdType,
        template_id: impl Into<String>,
        template_version: impl Into<String>,
        variables: CardVariables,
    ) -> Self {
        Self {
            receive_id: receive_id.into(),
            receive_id_type,
            template_id: template_id.into(),
            template_version: template_version.into(),
            variables,
        }
    }

    /// Serialize the `content` string of an interactive template message.
    ///
    /// # Errors
    /// Returns an error if the variables cannot be serialized.
    pub fn content_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&serde_json::json!({
            "type": "template",
            "data": {
                "template_id": self.template_id,
                "template_version_name": self.template_version,
                "template_variable": self.variables,
            }
        }))
    }
}
